use crate::tree::TreeError;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("api error: {0}")]
    Api(String),

    #[error("state tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("session error: {0}")]
    Session(#[from] carlink_session::Error),
}

pub type AdapterResult<T> = Result<T, AdapterError>;
