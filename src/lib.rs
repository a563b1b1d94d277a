//! Request-execution core for OAuth 2.0 protected REST APIs: single-flight token refresh,
//! sliding-window rate limiting, and classified retries behind one `execute` call.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

#[macro_use]
pub mod obs;

pub mod auth;
pub mod classify;
pub mod clock;
pub mod config;
pub mod coord;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod http;
mod oauth;
pub mod rate_limit;
pub mod store;

mod state_file;

mod _prelude {
	pub use std::{
		collections::{HashMap, VecDeque},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{ApiError, ApiErrorKind, Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _, tempfile as _};
