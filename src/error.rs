use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown profile, missing export directory, duplicate registration.
    /// Raised before any I/O is attempted.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection error on profile `{profile}`: {source}")]
    Connection {
        profile: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("execution error: {0}")]
    Execution(#[from] sqlx::Error),
    #[error("export error: {0}")]
    Export(String),
    #[error("compile error in template `{template}`: {message}")]
    Compile { template: String, message: String },
    #[error("template `{template}` failed: {message}")]
    Template { template: String, message: String },
    #[error("request scope `{scope}`: {message}")]
    Scope { scope: String, message: String },
    #[error("askama error: {0}")]
    Askama(#[from] askama::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("profile config error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("fmt error: {0}")]
    Fmt(#[from] std::fmt::Error),
    #[error("{0}")]
    Message(String),
    #[error("multiple errors: {0:?}")]
    MultipleErrors(Vec<Error>),
}

impl Error {
    pub(crate) fn connection(profile: &str, source: sqlx::Error) -> Self {
        Error::Connection {
            profile: profile.to_string(),
            source,
        }
    }

    pub(crate) fn profile_not_found(profile: &str) -> Self {
        Error::Configuration(format!("profile instance `{profile}` not found"))
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Message(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Message(e.to_string())
    }
}

impl From<Vec<Error>> for Error {
    fn from(e: Vec<Error>) -> Self {
        Error::MultipleErrors(e)
    }
}
