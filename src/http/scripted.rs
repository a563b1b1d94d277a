// std
use std::io;
// crates.io
use oauth2::http::Response;
// self
use crate::{
	_prelude::*,
	error::TransportError,
	http::{
		HeaderMap, HeaderName, HeaderValue, HttpRequest, HttpResponse, HttpTransport,
		TransportFuture,
	},
};

/// Canned outcome replayed by [`ScriptedTransport`].
#[derive(Clone, Debug)]
pub enum ScriptedReply {
	/// HTTP response with status, headers, and body.
	Response {
		/// HTTP status code.
		status: u16,
		/// Response headers as name/value pairs.
		headers: Vec<(String, String)>,
		/// Raw body.
		body: Vec<u8>,
	},
	/// Transport timeout; no response is produced.
	Timeout,
	/// Connection failure; no response is produced.
	ConnectionFailure,
}
impl ScriptedReply {
	/// Empty-bodied response with the given status.
	pub fn status(status: u16) -> Self {
		Self::Response { status, headers: Vec::new(), body: Vec::new() }
	}

	/// JSON response with the given status.
	pub fn json(status: u16, body: serde_json::Value) -> Self {
		Self::Response {
			status,
			headers: vec![("content-type".into(), "application/json".into())],
			body: body.to_string().into_bytes(),
		}
	}

	/// Plain-text response with the given status.
	pub fn text(status: u16, body: impl Into<String>) -> Self {
		Self::Response {
			status,
			headers: vec![("content-type".into(), "text/plain".into())],
			body: body.into().into_bytes(),
		}
	}

	/// Adds a header. No-op for transport failures.
	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		if let Self::Response { headers, .. } = &mut self {
			headers.push((name.into(), value.into()));
		}

		self
	}
}

/// Request observed by [`ScriptedTransport`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
	/// HTTP method.
	pub method: String,
	/// Full request URI.
	pub uri: String,
	/// URI path, used for routing.
	pub path: String,
	/// Request headers.
	pub headers: HeaderMap,
	/// Raw body.
	pub body: Vec<u8>,
}
impl RecordedRequest {
	/// Header value as text.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|value| value.to_str().ok())
	}

	/// Value of a form-encoded body parameter.
	pub fn form_param(&self, name: &str) -> Option<String> {
		url::form_urlencoded::parse(&self.body)
			.find(|(key, _)| key == name)
			.map(|(_, value)| value.into_owned())
	}
}

#[derive(Debug, Default)]
struct Route {
	queue: VecDeque<ScriptedReply>,
	fallback: Option<ScriptedReply>,
}

/// In-process [`HttpTransport`] replaying scripted replies per URI path.
///
/// Queued replies are consumed in order; once a path's queue is empty its fallback (if any)
/// repeats forever. Unscripted paths answer `404`. Every request is recorded.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
	routes: Mutex<HashMap<String, Route>>,
	requests: Mutex<Vec<RecordedRequest>>,
	latency: Mutex<Option<std::time::Duration>>,
}
impl ScriptedTransport {
	/// Creates an empty transport.
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues a one-shot reply for `path`.
	pub fn enqueue(&self, path: impl Into<String>, reply: ScriptedReply) -> &Self {
		self.routes.lock().entry(path.into()).or_default().queue.push_back(reply);

		self
	}

	/// Sets the reply repeated for `path` once its queue is drained.
	pub fn always(&self, path: impl Into<String>, reply: ScriptedReply) -> &Self {
		self.routes.lock().entry(path.into()).or_default().fallback = Some(reply);

		self
	}

	/// Delays every reply by `latency` of wall-clock time.
	pub fn set_latency(&self, latency: std::time::Duration) -> &Self {
		*self.latency.lock() = Some(latency);

		self
	}

	/// All recorded requests, in arrival order.
	pub fn requests(&self) -> Vec<RecordedRequest> {
		self.requests.lock().clone()
	}

	/// Number of requests received for `path`.
	pub fn calls(&self, path: &str) -> usize {
		self.requests.lock().iter().filter(|request| request.path == path).count()
	}

	fn next_reply(&self, path: &str) -> Option<ScriptedReply> {
		let mut routes = self.routes.lock();
		let route = routes.get_mut(path)?;

		route.queue.pop_front().or_else(|| route.fallback.clone())
	}
}
impl HttpTransport for ScriptedTransport {
	fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let path = request.uri().path().to_owned();

			self.requests.lock().push(RecordedRequest {
				method: request.method().to_string(),
				uri: request.uri().to_string(),
				path: path.clone(),
				headers: request.headers().clone(),
				body: request.body().clone(),
			});

			let latency = *self.latency.lock();

			if let Some(latency) = latency {
				tokio::time::sleep(latency).await;
			}

			match self.next_reply(&path).unwrap_or_else(|| ScriptedReply::status(404)) {
				ScriptedReply::Response { status, headers, body } =>
					build_response(status, headers, body),
				ScriptedReply::Timeout => Err(TransportError::timeout(io::Error::new(
					io::ErrorKind::TimedOut,
					"scripted timeout",
				))),
				ScriptedReply::ConnectionFailure => Err(TransportError::network(io::Error::new(
					io::ErrorKind::ConnectionRefused,
					"scripted connection failure",
				))),
			}
		})
	}
}

fn build_response(
	status: u16,
	headers: Vec<(String, String)>,
	body: Vec<u8>,
) -> Result<HttpResponse, TransportError> {
	let mut response = Response::builder().status(status);

	for (name, value) in headers {
		let name = HeaderName::try_from(name).map_err(TransportError::network)?;
		let value = HeaderValue::try_from(value).map_err(TransportError::network)?;

		response = response.header(name, value);
	}

	response.body(body).map_err(TransportError::network)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn request(path: &str) -> HttpRequest {
		oauth2::http::Request::builder()
			.uri(format!("https://api.example.com{path}"))
			.body(b"grant_type=refresh_token&refresh_token=r%2B1".to_vec())
			.expect("Request fixture should build.")
	}

	#[tokio::test]
	async fn replays_queue_then_fallback() {
		let transport = ScriptedTransport::new();

		transport
			.enqueue("/items", ScriptedReply::status(503))
			.always("/items", ScriptedReply::json(200, serde_json::json!({ "ok": true })));

		let first =
			transport.send(request("/items")).await.expect("First reply should be a response.");
		let second =
			transport.send(request("/items")).await.expect("Fallback should be a response.");
		let third = transport.send(request("/items")).await.expect("Fallback should repeat.");
		let unscripted =
			transport.send(request("/other")).await.expect("Unscripted path should 404.");

		assert_eq!(first.status(), 503);
		assert_eq!(second.status(), 200);
		assert_eq!(third.body(), br#"{"ok":true}"#);
		assert_eq!(unscripted.status(), 404);
		assert_eq!(transport.calls("/items"), 3);
		assert_eq!(transport.requests()[0].form_param("refresh_token").as_deref(), Some("r+1"));
	}

	#[tokio::test]
	async fn transport_failures_are_typed() {
		let transport = ScriptedTransport::new();

		transport.enqueue("/items", ScriptedReply::Timeout);
		transport.enqueue("/items", ScriptedReply::ConnectionFailure);

		let timeout = transport.send(request("/items")).await.expect_err("Timeout should fail.");
		let refused = transport.send(request("/items")).await.expect_err("Connection should fail.");

		assert!(timeout.is_timeout());
		assert!(!refused.is_timeout());
	}
}
