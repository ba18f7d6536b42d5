use std::{error::Error, fmt, sync::Arc};

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone)]
pub enum StreamError {
    Canceled,
    Aborted(Option<String>),
    Closing,
    Closed,
    TaskDropped,
    /// The stream already has a reader or writer
    Locked,
    /// The reader or writer no longer holds the lock
    Released,
    /// The transform stream was terminated by its controller
    Terminated,
    /// Usage or protocol violations such as enqueueing in the wrong state
    Type(String),
    /// Out of range values: sizes, high-water marks, view lengths
    Range(String),
    /// Cancel reasons of both tee branches, in branch order
    Composite(Vec<Option<StreamError>>),
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        StreamError::Type(message.into())
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        StreamError::Range(message.into())
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use lws_streams::{impl_stream_error_from, StreamError};
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn example() -> Result<(), StreamError> {
///     Err(ParseError)?;
///     Ok(())
/// }
/// assert!(example().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Canceled => write!(f, "Stream operation was canceled"),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::Closing => write!(f, "Stream is closing"),
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::Locked => write!(f, "Stream is locked"),
            StreamError::Released => write!(f, "Lock was released"),
            StreamError::Terminated => write!(f, "TransformStream terminated"),
            StreamError::Type(message) => write!(f, "TypeError: {}", message),
            StreamError::Range(message) => write!(f, "RangeError: {}", message),
            StreamError::Composite(reasons) => {
                write!(f, "[")?;
                for (i, reason) in reasons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match reason {
                        Some(reason) => write!(f, "{}", reason)?,
                        None => write!(f, "undefined")?,
                    }
                }
                write!(f, "]")
            }
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_conversions_work() {
        let _: StreamError = "error message".into();
        let _: StreamError = String::from("error").into();

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let _: StreamError = io_err.into();

        #[derive(Debug)]
        struct CustomError;
        impl fmt::Display for CustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "custom error")
            }
        }
        impl Error for CustomError {}

        let err = StreamError::other(CustomError);
        assert_eq!(err.to_string(), "custom error");
        assert!(err.source().is_some());

        let boxed: Box<dyn Error + Send + Sync> = Box::new(CustomError);
        let err: StreamError = boxed.into();
        assert!(matches!(err, StreamError::Other(_)));
        assert_eq!(err.to_string(), "custom error");
    }

    #[test]
    fn test_macro_usage_example() -> Result<(), Box<dyn Error>> {
        #[derive(Debug)]
        struct UserCustomError(String);
        impl fmt::Display for UserCustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "User error: {}", self.0)
            }
        }
        impl Error for UserCustomError {}

        impl_stream_error_from!(UserCustomError);

        fn user_function() -> Result<(), StreamError> {
            fn might_fail() -> Result<(), UserCustomError> {
                Err(UserCustomError("something went wrong".to_string()))
            }
            might_fail()?;
            Ok(())
        }

        let err = user_function().unwrap_err();
        assert_eq!(err.to_string(), "User error: something went wrong");
        Ok(())
    }

    #[test]
    fn composite_reasons_display_in_branch_order() {
        let err = StreamError::Composite(vec![Some("first".into()), None]);
        assert_eq!(err.to_string(), "[first, undefined]");
    }

    #[test]
    fn usage_errors_carry_their_class() {
        assert_eq!(
            StreamError::type_error("bad view").to_string(),
            "TypeError: bad view"
        );
        assert_eq!(
            StreamError::range_error("negative size").to_string(),
            "RangeError: negative size"
        );
    }
}
