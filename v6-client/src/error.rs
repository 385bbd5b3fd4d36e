use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("coordinator returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("crypto error: {0}")]
    Crypto(#[from] v6_crypto::CryptoError),
}
