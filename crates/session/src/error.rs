use parley_crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Neither the direct channel nor the signaling socket can carry the
    /// message. The caller keeps its local echo.
    #[error("no transport available to deliver the message")]
    NoTransportAvailable,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Offer/answer creation or candidate application failed.
    #[error("peer connection failure: {0}")]
    PeerConnection(String),
    #[error("signaling transport failure: {0}")]
    Signaling(String),
    #[error("internal session failure: {0}")]
    Internal(String),
}
