use crate::database::DatabaseSetupError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to parse program command line arguments: {0}")]
    ArgumentError(pico_args::Error),

    #[error("service couldn't connect to its database: {0}")]
    DatabaseSetup(#[from] DatabaseSetupError),

    #[error("configuration is incomplete: {0}")]
    IncompleteConfig(&'static str),

    #[error("setting '{0}' couldn't be parsed: {1}")]
    InvalidSetting(&'static str, String),

    #[error("unable to prepare the local lake directory: {0}")]
    LakeSetup(std::io::Error),

    #[error("object store rejected the lake location: {0}")]
    LakeStore(object_store::Error),
}
