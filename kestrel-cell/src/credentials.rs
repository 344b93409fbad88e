//! Generated secrets.

use rand::Rng;

/// Length of generated admin passwords.
pub const PASSWORD_LENGTH: usize = 10;
/// Length of generated monitor secrets.
pub const MONITOR_SECRET_LENGTH: usize = 8;

const LETTERS: &[u8] = b"~!@#$%^&*()_[]-=+0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a random secret of the given length.
pub fn generate_password(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_has_requested_length() {
        assert_eq!(generate_password(PASSWORD_LENGTH).len(), PASSWORD_LENGTH);
        assert_eq!(generate_password(MONITOR_SECRET_LENGTH).len(), MONITOR_SECRET_LENGTH);
    }

    #[test]
    fn generated_secrets_differ() {
        assert_ne!(generate_password(16), generate_password(16));
    }
}
