//! Priority-bucketed routing rules.
//!
//! A [`Router`] holds an ordered table of [`Rule`]s, each a set of regex
//! patterns over the request path (and optionally the query string and
//! the Host header) plus a destination map. [`Router::process`] walks the
//! priority buckets from [`Priority::Top`] down and returns every rule
//! that matches, in order; consumers take the first match unless a rule
//! asks for further processing via `process_next`.
//!
//! The WebSocket server consumes this table read-only: the `"service"`
//! destination of the first match decides which service adopts a freshly
//! upgraded connection.
//!
//! # Example
//!
//! ```
//! use iris_router::{Priority, Router, Rule};
//!
//! let mut router = Router::new();
//! router.add_rule(
//!     Rule::builder()
//!         .source("^/chat")
//!         .destination("service", "chat")
//!         .build()
//!         .unwrap(),
//! );
//! router.add_rule(
//!     Rule::builder()
//!         .priority(Priority::Bottom)
//!         .source(".*")
//!         .destination("service", "fallback")
//!         .build()
//!         .unwrap(),
//! );
//!
//! let matches = router.process("/chat/42", None, None);
//! assert_eq!(matches[0].destination("service"), Some("chat"));
//! assert_eq!(matches[1].destination("service"), Some("fallback"));
//! ```

pub mod rule;
pub mod router;

pub use router::{RouteMatch, Router};
pub use rule::{Priority, Rule, RuleBuilder, RuleError, RuleSpec};
