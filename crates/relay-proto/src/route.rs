//! Routing outcomes.
//!
//! Envelopes carry their receiver as a plain name so they stay serializable.
//! Code that decides where an envelope goes next works with [`Route`]
//! instead, so the terminal case is a variant rather than a string compare.

use std::fmt;

/// Receiver name meaning the pipeline has completed.
pub const FINAL: &str = "Final";

/// Sender name used on every envelope the dispatcher escalates.
pub const ROUTER: &str = "Router";

/// Where an envelope goes after a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Dispatch to the named capability next.
    Continue(String),
    /// Stop the pipeline; the envelope is addressed to [`FINAL`].
    Terminate,
}

impl Route {
    /// Routes to the named capability.
    ///
    /// Naming the sentinel yields [`Route::Terminate`].
    pub fn to(receiver: impl Into<String>) -> Self {
        Self::from_receiver(receiver.into())
    }

    /// Interprets a receiver name as a route.
    pub fn from_receiver(receiver: impl Into<String>) -> Self {
        let receiver = receiver.into();
        if receiver == FINAL {
            Route::Terminate
        } else {
            Route::Continue(receiver)
        }
    }

    /// Returns the receiver name to write on an envelope.
    pub fn receiver(&self) -> &str {
        match self {
            Route::Continue(name) => name,
            Route::Terminate => FINAL,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Route::Terminate)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.receiver())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_maps_to_terminate() {
        assert_eq!(Route::to("Final"), Route::Terminate);
        assert_eq!(Route::Terminate.receiver(), "Final");
        assert!(Route::Terminate.is_terminal());
    }

    #[test]
    fn test_named_route_continues() {
        let route = Route::to("Transform");
        assert_eq!(route, Route::Continue("Transform".to_string()));
        assert_eq!(route.receiver(), "Transform");
        assert!(!route.is_terminal());
    }
}
