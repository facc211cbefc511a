//! Error types and result definitions for pipeline operations.
//!
//! Elements never carry errors through a pipeline. A [`ConduitError`] is only produced when a
//! component is built with invalid parameters, when a worker panics or is aborted, or when an
//! external source reports a failure out-of-band. Errors from many workers are aggregated into a
//! single [`ConduitError`] when a pipeline is joined.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use conduit_config::shared::ValidationError;

/// Convenient result type for pipeline operations using [`ConduitError`] as the error type.
pub type ConduitResult<T> = Result<T, ConduitError>;

/// Detailed payload stored for single [`ConduitError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for pipeline operations.
///
/// [`ConduitError`] represents either a single error with rich metadata or several aggregated
/// errors, which is what joining a pipeline with many failed workers produces.
#[derive(Debug, Clone)]
pub struct ConduitError {
    repr: ErrorRepr,
}

/// Internal representation of error data.
#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors, mainly produced when several workers fail.
    Many {
        errors: Vec<ConduitError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur while building or running a pipeline.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A component was constructed with parameters it cannot work with.
    InvalidConfiguration,
    /// Pipeline configuration failed validation.
    ConfigError,
    /// A worker task panicked.
    WorkerPanic,
    /// A worker task was aborted before it could finish.
    WorkerCancelled,
    /// An external source reported that it could not produce its input.
    SourceFailure,
    /// Uncategorized error.
    Unknown,
}

impl ConduitError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the static description of this error.
    ///
    /// For multiple errors, returns the description of the first one.
    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { ref errors, .. } => errors.first().and_then(|e| e.description()),
        }
    }

    /// Returns the detailed error information if available.
    ///
    /// For multiple errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    /// Creates a [`ConduitError`] from its components.
    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        ConduitError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for ConduitError {
    fn eq(&self, other: &ConduitError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ConduitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f, 1)?;
                write_backtrace(payload.backtrace.as_ref(), f, 1)?;

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    let mut lines = rendered.lines();
                    match lines.next() {
                        Some(first_line) => write!(f, "\n  {}. {}", index + 1, first_line)?,
                        None => write!(f, "\n  {}.", index + 1)?,
                    }

                    for line in lines {
                        if line.is_empty() {
                            write!(f, "\n     ")?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ConduitError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes the captured backtrace with indentation.
fn write_backtrace(
    backtrace: &Backtrace,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
) -> fmt::Result {
    let indent_str = "  ".repeat(indent);

    let rendered_backtrace = format!("{backtrace}");
    if !rendered_backtrace.trim().is_empty() {
        write!(f, "\n{indent_str}Backtrace:")?;
        for line in rendered_backtrace.lines() {
            if line.trim().is_empty() {
                write!(f, "\n{indent_str}  ")?;
            } else {
                write!(f, "\n{indent_str}  {line}")?;
            }
        }
    }

    Ok(())
}

/// Writes the detail block with indentation.
fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    if let Some(detail) = detail {
        let indent_str = "  ".repeat(indent);
        if detail.trim().is_empty() {
            write!(f, "\n{indent_str}Detail: <empty>")?;
        } else {
            write!(f, "\n{indent_str}Detail:")?;
            for line in detail.lines() {
                write!(f, "\n{indent_str}  {line}")?;
            }
        }
    }

    Ok(())
}

/// Creates a [`ConduitError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for ConduitError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> ConduitError {
        ConduitError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`ConduitError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for ConduitError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> ConduitError {
        ConduitError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Creates a [`ConduitError`] from a vector of errors for aggregation.
///
/// A vector with exactly one error yields that error unchanged.
impl<E> From<Vec<E>> for ConduitError
where
    E: Into<ConduitError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> ConduitError {
        let location = Location::caller();

        let mut errors: Vec<ConduitError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        ConduitError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts [`ValidationError`] to [`ConduitError`] with [`ErrorKind::ConfigError`].
impl From<ValidationError> for ConduitError {
    #[track_caller]
    fn from(err: ValidationError) -> ConduitError {
        let detail = err.to_string();
        let source = Arc::new(err);
        ConduitError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid pipeline configuration"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit_error;

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let err = conduit_error!(
            ErrorKind::InvalidConfiguration,
            "Tee needs at least two outputs",
            "requested 1 output"
        );

        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(err.kinds(), vec![ErrorKind::InvalidConfiguration]);
        assert_eq!(err.description(), Some("Tee needs at least two outputs"));
        assert_eq!(err.detail(), Some("requested 1 output"));
        assert!(err.location().file().ends_with("error.rs"));
    }

    #[test]
    fn aggregating_one_error_returns_it_unchanged() {
        let err: ConduitError =
            vec![conduit_error!(ErrorKind::WorkerPanic, "Worker panicked")].into();

        assert_eq!(err.kind(), ErrorKind::WorkerPanic);
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn aggregating_many_errors_flattens_kinds() {
        let inner: ConduitError = vec![
            conduit_error!(ErrorKind::WorkerPanic, "Worker panicked"),
            conduit_error!(ErrorKind::SourceFailure, "Source failed"),
        ]
        .into();
        let err: ConduitError = vec![
            inner,
            conduit_error!(ErrorKind::WorkerCancelled, "Worker was cancelled"),
        ]
        .into();

        assert_eq!(err.kind(), ErrorKind::WorkerPanic);
        assert_eq!(
            err.kinds(),
            vec![
                ErrorKind::WorkerPanic,
                ErrorKind::SourceFailure,
                ErrorKind::WorkerCancelled
            ]
        );
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn validation_errors_convert_to_config_errors() {
        let err: ConduitError = ValidationError::FanOutWorkersZero.into();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(err.detail(), Some("`fan_out.workers` cannot be zero"));
        assert!(error::Error::source(&err).is_some());
    }
}
