mod common;

// crates.io
use time::Duration;
// self
use common::{Harness, TOKEN_PATH, config, token_reply};
use oauth2_executor::{
	config::RateLimitConfig,
	error::ApiErrorKind,
	http::{ApiRequest, ScriptedReply},
};

const DEALS: &str = "/v1/deals";

#[tokio::test]
async fn constant_server_errors_are_retried_a_bounded_number_of_times() {
	let harness = Harness::new(config());

	harness.transport.always(DEALS, ScriptedReply::text(503, "maintenance"));

	let err = harness
		.executor
		.execute(ApiRequest::get("deals"))
		.await
		.expect_err("Every attempt fails.");
	let sleeps = harness.clock.sleeps();

	assert_eq!(err.kind(), Some(ApiErrorKind::Server));
	assert_eq!(err.api().and_then(|api| api.status), Some(503));
	assert_eq!(harness.transport.calls(DEALS), 3);
	assert_eq!(sleeps.len(), 2);
	assert!(sleeps[0] < sleeps[1]);
	assert!(harness.clock.total_slept() <= Duration::seconds(20));
}

#[tokio::test]
async fn validation_errors_are_not_retried_and_keep_field_details() {
	let harness = Harness::new(config());

	harness.transport.enqueue(
		DEALS,
		ScriptedReply::json(
			422,
			serde_json::json!({
				"message": "Validation failed",
				"errors": [{ "field": "amount", "message": "must be positive", "code": "range" }]
			}),
		),
	);

	let err = harness
		.executor
		.execute(
			ApiRequest::post("deals")
				.json_body(&serde_json::json!({ "amount": -1 }))
				.expect("Body should serialize."),
		)
		.await
		.expect_err("Payload is rejected.");
	let api = err.api().expect("Error should be classified.");

	assert_eq!(api.kind, ApiErrorKind::Validation);
	assert_eq!(api.field_errors.len(), 1);
	assert_eq!(api.field_errors[0].field.as_deref(), Some("amount"));
	assert_eq!(harness.transport.calls(DEALS), 1);
	assert!(harness.clock.sleeps().is_empty());
}

#[tokio::test]
async fn unauthorized_response_triggers_one_refresh_and_retry() {
	let harness = Harness::new(config());

	harness
		.transport
		.enqueue(DEALS, ScriptedReply::json(401, serde_json::json!({ "message": "expired" })))
		.enqueue(DEALS, ScriptedReply::json(200, serde_json::json!([])));
	harness.transport.enqueue(TOKEN_PATH, token_reply("access-2", "refresh-2"));

	harness.executor.execute(ApiRequest::get("deals")).await.expect("Retry should succeed.");

	let api_calls = harness
		.transport
		.requests()
		.into_iter()
		.filter(|request| request.path == DEALS)
		.collect::<Vec<_>>();

	assert_eq!(harness.transport.calls(TOKEN_PATH), 1);
	assert_eq!(api_calls[0].header("authorization"), Some("Bearer access-1"));
	assert_eq!(api_calls[1].header("authorization"), Some("Bearer access-2"));
}

#[tokio::test]
async fn second_unauthorized_response_is_surfaced() {
	let harness = Harness::new(config());

	harness.transport.always(DEALS, ScriptedReply::status(401));
	harness.transport.enqueue(TOKEN_PATH, token_reply("access-2", "refresh-2"));

	let err = harness
		.executor
		.execute(ApiRequest::get("deals"))
		.await
		.expect_err("Recovery is used once.");
	let api = err.api().expect("Error should be classified.");

	assert_eq!(api.kind, ApiErrorKind::Authentication);
	assert!(!api.reauthorization_required);
	assert_eq!(harness.transport.calls(DEALS), 2);
	assert_eq!(harness.transport.calls(TOKEN_PATH), 1);
}

#[tokio::test]
async fn rate_limited_responses_wait_without_consuming_the_budget() {
	let harness = Harness::new(config());

	for _ in 0..3 {
		harness.transport.enqueue(DEALS, ScriptedReply::status(429).header("retry-after", "2"));
	}

	harness.transport.enqueue(DEALS, ScriptedReply::json(200, serde_json::json!({})));
	harness.executor.execute(ApiRequest::get("deals")).await.expect("Fourth attempt succeeds.");

	assert_eq!(harness.transport.calls(DEALS), 4);
	assert_eq!(harness.clock.total_slept(), Duration::seconds(6));
}

#[tokio::test]
async fn rate_limit_beyond_the_deadline_returns_the_classified_error() {
	let harness = Harness::new(config());

	harness.transport.enqueue(DEALS, ScriptedReply::status(429).header("retry-after", "600"));

	let err = harness
		.executor
		.execute(ApiRequest::get("deals"))
		.await
		.expect_err("Throttle outlasts the call.");
	let api = err.api().expect("Error should be classified.");

	assert_eq!(api.kind, ApiErrorKind::RateLimited);
	assert_eq!(api.retry_after, Some(Duration::minutes(10)));
	assert_eq!(harness.transport.calls(DEALS), 1);

	let blocked = harness
		.executor
		.execute(ApiRequest::get("deals"))
		.await
		.expect_err("Server throttle still applies to the next call.");

	assert!(blocked.api().is_some_and(|api| api.timed_out));
	assert_eq!(harness.transport.calls(DEALS), 1);
}

#[tokio::test]
async fn saturated_window_fails_once_the_deadline_would_pass() {
	let mut config = config();

	config.rate_limit =
		RateLimitConfig { ceiling: 2, throttle_threshold: 1.0, ..Default::default() };

	let harness = Harness::new(config);

	harness.transport.always(DEALS, ScriptedReply::status(204));

	for _ in 0..2 {
		harness.executor.execute(ApiRequest::get("deals")).await.expect("Window has room.");
	}

	let err = harness
		.executor
		.execute(ApiRequest::get("deals"))
		.await
		.expect_err("Next slot frees up after the deadline.");

	assert_eq!(err.kind(), Some(ApiErrorKind::Network));
	assert!(err.api().is_some_and(|api| api.timed_out));
	assert_eq!(harness.transport.calls(DEALS), 2);
}

#[tokio::test]
async fn transient_refresh_failure_is_retried_before_dispatch() {
	let seeded = common::credential("stale", "refresh-1", common::START, Duration::seconds(20));
	let harness = Harness::with_credential(config(), seeded);

	harness
		.transport
		.enqueue(TOKEN_PATH, ScriptedReply::text(502, "bad gateway"))
		.enqueue(TOKEN_PATH, token_reply("fresh", "refresh-2"));
	harness.transport.enqueue(DEALS, ScriptedReply::status(204));
	harness.executor.execute(ApiRequest::get("deals")).await.expect("Second refresh succeeds.");

	assert_eq!(harness.transport.calls(TOKEN_PATH), 2);
	assert_eq!(harness.transport.calls(DEALS), 1);
	assert_eq!(harness.clock.sleeps().len(), 1);
}

#[tokio::test]
async fn retry_blocked_by_admission_surfaces_the_last_classified_error() {
	let mut config = config();

	config.rate_limit =
		RateLimitConfig { ceiling: 2, throttle_threshold: 1.0, ..Default::default() };

	let harness = Harness::new(config);

	harness.transport.enqueue(DEALS, ScriptedReply::status(204));
	harness.transport.always(DEALS, ScriptedReply::text(503, "maintenance"));
	harness.executor.execute(ApiRequest::get("deals")).await.expect("Window has room.");

	let err = harness
		.executor
		.execute(ApiRequest::get("deals"))
		.await
		.expect_err("Retry cannot be admitted before the deadline.");
	let api = err.api().expect("Error should be classified.");

	assert_eq!(api.kind, ApiErrorKind::Server);
	assert_eq!(api.status, Some(503));
	assert!(!api.timed_out);
	assert_eq!(harness.transport.calls(DEALS), 2);
	assert_eq!(harness.clock.sleeps().len(), 1);
}

#[tokio::test]
async fn expired_credential_is_refreshed_before_dispatch() {
	let seeded = common::credential("stale", "refresh-1", common::START, Duration::seconds(20));
	let harness = Harness::with_credential(config(), seeded);

	harness.transport.enqueue(TOKEN_PATH, token_reply("fresh", "refresh-2"));
	harness.transport.enqueue(DEALS, ScriptedReply::status(204));
	harness.executor.execute(ApiRequest::get("deals")).await.expect("Call should succeed.");

	let api_call = harness
		.transport
		.requests()
		.into_iter()
		.find(|request| request.path == DEALS)
		.expect("API call should be recorded.");

	assert_eq!(api_call.header("authorization"), Some("Bearer fresh"));
	assert_eq!(harness.executor.credentials().refresh_metrics().rotations(), 1);
}
