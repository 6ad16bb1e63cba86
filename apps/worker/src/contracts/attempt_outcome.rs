/// Classified result of a single attempt of a retried operation.
///
/// The retry loop never inspects raw errors; it matches on this value:
/// - `Success`: the attempt produced a value.
/// - `Reauthenticate`: credentials were rejected. Refresh them, then retry.
/// - `Retryable`: transient failure. Wait, then retry with the same client.
/// - `Fatal`: retrying cannot help. Surface immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Reauthenticate(E),
    Retryable(E),
    Fatal(E),
}

impl<T, E> AttemptOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Reauthenticate(_) | Self::Retryable(_))
    }

    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::Reauthenticate(_))
    }

    /// Label used for log `outcome` fields and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Reauthenticate(_) => "auth_failure",
            Self::Retryable(_) => "transient_failure",
            Self::Fatal(_) => "fatal",
        }
    }

    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Success(_) => None,
            Self::Reauthenticate(e) | Self::Retryable(e) | Self::Fatal(e) => Some(e),
        }
    }
}
