use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::SecretString;

/// Random `[A-Za-z0-9]` string of the given length.
pub fn alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Lowercase variant, for identifiers that end up in usernames and key names.
pub fn lowercase_alphanumeric(len: usize) -> String {
    alphanumeric(len).to_ascii_lowercase()
}

pub fn secret(len: usize) -> SecretString {
    SecretString::from(alphanumeric(len))
}
