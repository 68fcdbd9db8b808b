use std::{
    fmt::{self, Display, Formatter},
    io::stderr,
    str::FromStr,
};

use tracing_subscriber::{
    filter::ParseError,
    fmt::layer,
    layer::SubscriberExt,
    registry,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

// Types

pub type Result<T = ()> = std::result::Result<T, Error>;

// Error

#[derive(Debug, thiserror::Error)]
#[error("failed to initialize tracer: {0}")]
pub enum Error {
    Init(
        #[from]
        #[source]
        TryInitError,
    ),
    Filter(
        #[from]
        #[source]
        ParseError,
    ),
}

// LogFormat

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let format = match self {
            Self::Compact => "compact",
            Self::Full => "full",
            Self::Json => "json",
        };
        f.write_str(format)
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "compact" => Ok(Self::Compact),
            "full" => Ok(Self::Full),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format `{s}` (expected one of: compact, full, json)"
            )),
        }
    }
}

// Functions

pub fn init_tracer<FILTER: Into<String>>(log_filter: FILTER, format: LogFormat) -> Result {
    let filter = EnvFilter::builder().parse(log_filter.into())?;
    let registry = registry().with(filter);
    match format {
        LogFormat::Compact => registry
            .with(layer().compact().with_writer(stderr))
            .try_init()?,
        LogFormat::Full => registry.with(layer().with_writer(stderr)).try_init()?,
        LogFormat::Json => registry
            .with(layer().json().with_writer(stderr))
            .try_init()?,
    }
    Ok(())
}

// Tests
