use crate::rdns::RdnsClient;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::time::{
    interval_at,
    Instant,
    MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// Renews the cluster domain every `period` until `stop` is cancelled. The first renewal happens one period after
/// start. Failures are logged, the next tick tries again.
pub async fn run_renew_loop(rdns: Arc<RdnsClient>, period: Duration, stop: CancellationToken) {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period = %humantime::format_duration(period), "Starting renew loop");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = timer.tick() => {}
        }

        match rdns.renew_domain().await {
            Ok(domain) => info!(fqdn = %domain.fqdn, "renewed domain"),
            Err(err) => error!("Failed to renew domain: {err}"),
        }
    }

    info!("Renew loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTokenStore;
    use serde_json::json;
    use wiremock::{
        matchers::{
            header,
            method,
            path,
        },
        Mock,
        MockServer,
        ResponseTemplate,
    };

    #[tokio::test]
    async fn keeps_ticking_without_credentials() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryTokenStore::default());
        let rdns = Arc::new(RdnsClient::with_base_url(server.uri(), Duration::from_secs(5), store.clone()).unwrap());
        let stop = CancellationToken::new();

        let renew = tokio::spawn(run_renew_loop(rdns, Duration::from_millis(10), stop.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), renew)
            .await
            .expect("renew loop did not stop")
            .unwrap();

        assert!(store.gets() >= 2, "expected several renew attempts, got {}", store.gets());
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn renews_with_stored_token() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/domain/abc.rancher.io/renew"))
            .and(header("authorization", "Bearer t0k3n"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "fqdn": "abc.rancher.io", "hosts": ["10.0.0.5"] }
            })))
            .expect(1..)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTokenStore::with_credentials("t0k3n", "abc.rancher.io"));
        let rdns = Arc::new(RdnsClient::with_base_url(server.uri(), Duration::from_secs(5), store).unwrap());
        let stop = CancellationToken::new();

        let renew = tokio::spawn(run_renew_loop(rdns, Duration::from_millis(10), stop.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        renew.await.unwrap();
    }

    #[tokio::test]
    async fn stops_before_first_tick() {
        let store = Arc::new(MemoryTokenStore::default());
        let rdns = Arc::new(RdnsClient::with_base_url("http://127.0.0.1:1", Duration::from_secs(1), store.clone()).unwrap());
        let stop = CancellationToken::new();
        stop.cancel();

        run_renew_loop(rdns, Duration::from_secs(3600), stop).await;

        assert_eq!(store.gets(), 0);
    }
}
