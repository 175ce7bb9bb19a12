//! Token issuance/verification and the authenticated-caller extractor.

mod extract;
mod tokens;

pub use extract::AuthUser;
pub use tokens::{
    Claims, IssuedTokens, SigningKeys, TokenError, TokenKind, TokenService, VerifiedToken,
};
