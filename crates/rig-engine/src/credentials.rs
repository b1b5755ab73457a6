//! Tenant credential minting.
//!
//! All material comes from the operating system RNG; lengths are the floor
//! for ssh passwords and jupyter tokens, never a maximum.

use rand::Rng;
use rand::rngs::OsRng;

/// Fixed login user created inside every tenant container.
pub const SSH_USERNAME: &str = "gpu-user";

const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
const TOKEN_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn sample(charset: &[u8], length: usize) -> String {
    (0..length)
        .map(|_| charset[OsRng.gen_range(0..charset.len())] as char)
        .collect()
}

/// 16+ characters from letters, digits, and symbols.
pub fn mint_ssh_password() -> String {
    sample(PASSWORD_CHARSET, 16)
}

/// 32+ alphanumeric characters.
pub fn mint_jupyter_token() -> String {
    sample(TOKEN_CHARSET, 32)
}
