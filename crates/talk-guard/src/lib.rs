//! # Talk Guard
//!
//! Safety pipeline around generating talks with an LLM.
//!
//! Talk Guard sits between the talk-writing application and the generation
//! endpoint and handles:
//!
//! - **Sanitization**: strips dangerous markup and injection payloads, redacts sensitive data
//! - **Content Policy**: detects manipulation attempts, inappropriate content and spam
//! - **Rate Limiting**: blocks identities by severity-tiered violation history
//! - **Generation**: retries transient upstream failures with bounded backoff
//! - **Output Validation**: allow-listed links, PII redaction, harm screening, length checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use talk_guard::{ChatMessage, FieldType, Guard, GuardConfig, GuardContext, TalkRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GuardConfig::from_file("talk-guard.toml")?.apply_env_overrides();
//!     let guard = Guard::new(config)?;
//!
//!     let topic = guard.validate_input("Faith in hard times", FieldType::Topic).await;
//!     let context = GuardContext::new().with_user_id("member-42");
//!
//!     let request = TalkRequest::new(vec![
//!         ChatMessage::system("You write sacrament meeting talks."),
//!         ChatMessage::user(format!("Write a talk about {}", topic.sanitized_value)),
//!     ])
//!     .with_duration(5);
//!
//!     match guard.generate_with_policy(request, &context).await {
//!         Ok(outcome) if outcome.accepted() => println!("{}", outcome.text),
//!         Ok(outcome) => eprintln!("Rejected: {:?}", outcome.errors),
//!         Err(e) => eprintln!("{}", e.user_message()),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! request ──► RateLimiter ──► Sanitizer ──► ContentPolicyFilter ──► GenerationClient ──► OutputValidator
//!                 ▲                                 │
//!                 └──────── ViolationStore ◄────────┘
//! ```

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod content;
pub mod error;
pub mod generation;
pub mod guard;
pub mod injection;
pub mod output;
pub mod pii;
pub mod policy;
pub mod rate_limit;
pub mod rules;
pub mod sanitizer;
pub mod spam;
pub mod throttle;
pub mod types;
pub mod violation;

pub use config::GuardConfig;
pub use error::{GuardError, Result};
pub use guard::{Guard, GuardBuilder};
pub use types::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheLayer, TtlCache};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::GuardConfig;
    pub use crate::error::{GuardError, Result};
    pub use crate::generation::{CompletionBackend, GenerationClient, UpstreamFailure};
    pub use crate::guard::{Guard, GuardBuilder};
    pub use crate::policy::ContentPolicyFilter;
    pub use crate::sanitizer::Sanitizer;
    pub use crate::types::*;
    pub use crate::violation::{InMemoryViolationStore, ViolationStore};
}
