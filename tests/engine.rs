#[cfg(test)]
mod engine {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;
    use volley::{
        BackoffStrategy, BoxError, EngineBuilder, ErrorKind, FailureCategory, PendingRequest,
        Progress, RequestHook, RetryPolicy,
        proxy::{ProxyDescriptor, ProxyRotator, ProxyScheme, RotationStrategy},
    };
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{any, header, path},
    };

    async fn mock_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    fn request(url: &str, max_retries: u32) -> PendingRequest {
        PendingRequest::try_from(url).unwrap().with_retry(
            RetryPolicy::default()
                .with_max_retries(max_retries)
                .with_backoff(
                    BackoffStrategy::Fixed,
                    Duration::from_millis(10),
                    Duration::from_millis(10),
                ),
        )
    }

    #[derive(Debug)]
    struct Explode;

    #[async_trait]
    impl RequestHook for Explode {
        async fn before_send(&self, _request: &mut PendingRequest) -> Result<(), BoxError> {
            panic!("hook exploded")
        }
    }

    #[tokio::test]
    async fn test_waves_respect_rate_limit() {
        let server = mock_server(200).await;
        let engine = EngineBuilder::builder()
            .rate_limit(2_usize)
            .rate_limit_window(Duration::from_secs(1))
            .build()
            .engine();
        // An idle engine must not have used up part of its first window
        tokio::time::sleep(Duration::from_millis(900)).await;
        for i in 0..5 {
            engine.enqueue("pages", request(&format!("{}/{i}", server.uri()), 0));
        }

        let start = Instant::now();
        let responses = engine.run_batch("pages").await;
        assert_eq!(responses.len(), 5);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(engine.queue_depth("pages"), 0);
        assert_eq!(engine.stats().processed, 5);
    }

    #[tokio::test]
    async fn test_send_waits_for_retry_after() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = EngineBuilder::default().engine();
        let start = Instant::now();
        let response = engine.send(request(&server.uri(), 3)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.attempts, 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let errors: Arc<Mutex<Vec<FailureCategory>>> = Arc::default();
        let engine = EngineBuilder::default().engine();
        let sink = Arc::clone(&errors);
        engine.on_error(move |_, error| {
            sink.lock().unwrap().push(error.category());
            Ok(())
        });

        engine.enqueue("limited", request(&server.uri(), 2));
        let responses = engine.run_batch("limited").await;
        assert!(responses.is_empty());
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert_eq!(*errors.lock().unwrap(), vec![FailureCategory::RateLimited]);

        let stats = engine.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.errors, 1);
        engine.reset_stats();
        assert_eq!(engine.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_broken_callback_does_not_break_send() {
        let server = mock_server(200).await;
        let engine = EngineBuilder::default().engine();
        let calls = Arc::new(AtomicUsize::new(0));

        engine.on_response(|_, _| Err("observer is broken".into()));
        engine.on_response(|_, _| panic!("observer panicked"));
        let counter = Arc::clone(&calls);
        engine.on_response(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let response = engine.send(request(&server.uri(), 0)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_and_run_all() {
        let server = mock_server(200).await;
        let engine = EngineBuilder::default().engine();
        let reports: Arc<Mutex<Vec<Progress>>> = Arc::default();
        let sink = Arc::clone(&reports);
        engine.on_progress(move |progress| {
            sink.lock().unwrap().push(progress.clone());
            Ok(())
        });

        engine.enqueue_many("a", (0..3).map(|i| request(&format!("{}/a{i}", server.uri()), 0)));
        engine.enqueue_many("b", (0..2).map(|i| request(&format!("{}/b{i}", server.uri()), 0)));
        assert_eq!(engine.queue_depths().values().sum::<usize>(), 5);

        let responses = engine.run_all().await;
        assert_eq!(responses.len(), 5);
        assert!(engine.queue_depths().values().all(|&depth| depth == 0));

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 5);
        let last_a = reports.iter().filter(|p| p.batch == "a").last().unwrap();
        assert_eq!((last_a.completed, last_a.total, last_a.errors), (3, 3, 0));
        let last_b = reports.iter().filter(|p| p.batch == "b").last().unwrap();
        assert_eq!((last_b.completed, last_b.total), (2, 2));
    }

    #[tokio::test]
    async fn test_batch_management() {
        let engine = EngineBuilder::default().engine();
        engine.create_batch("b").unwrap();
        assert!(matches!(
            engine.create_batch("b"),
            Err(ErrorKind::BatchExists(_))
        ));
        engine.enqueue_url("a", "https://example.com/").unwrap();
        engine.enqueue_url("a", "https://example.org/").unwrap();
        assert!(engine.enqueue_url("a", "not a url").is_err());

        assert_eq!(engine.batch_names(), vec!["a", "b"]);
        assert_eq!(engine.queue_depth("a"), 2);
        assert_eq!(engine.queue_depth("missing"), 0);
        assert_eq!(engine.clear_batch("a"), 2);

        assert!(engine.remove_batch("b").is_some());
        assert_eq!(engine.batch_names(), vec!["a"]);
        assert!(engine.run_batch("b").await.is_empty());

        engine.shutdown().await;
        assert!(engine.batch_names().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_spreads_over_proxies() {
        // A mock server answers proxied plain HTTP requests like any other
        let first = mock_server(200).await;
        let second = mock_server(200).await;
        let proxies = [&first, &second].map(|server| {
            ProxyDescriptor::new(ProxyScheme::Http, "127.0.0.1", server.address().port())
        });

        let engine = EngineBuilder::builder()
            .rotator(Arc::new(ProxyRotator::from_proxies(
                proxies,
                3,
                RotationStrategy::RoundRobin,
            )))
            .build()
            .engine();
        for i in 0..4 {
            engine.enqueue("proxied", request(&format!("http://volley.test/{i}"), 0));
        }

        let responses = engine.run_batch("proxied").await;
        assert_eq!(responses.len(), 4);
        assert_eq!(first.received_requests().await.unwrap().len(), 2);
        assert_eq!(second.received_requests().await.unwrap().len(), 2);
        assert!(
            engine
                .rotator()
                .unwrap()
                .targets()
                .iter()
                .all(|t| t.failures() == 0)
        );
    }

    #[tokio::test]
    async fn test_session_cookies() {
        let server = MockServer::start().await;
        Mock::given(path("/login"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
            .mount(&server)
            .await;
        Mock::given(path("/account"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(path("/account"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let engine = EngineBuilder::builder()
            .persist_cookies(true)
            .build()
            .engine();
        engine
            .send(request(&format!("{}/login", server.uri()), 0))
            .await
            .unwrap();
        let account = engine
            .send(request(&format!("{}/account", server.uri()), 0))
            .await
            .unwrap();
        assert_eq!(account.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let server = mock_server(200).await;
        let engine = EngineBuilder::default().engine();
        let request = request(&server.uri(), 3);
        request.cancellation.cancel();

        let error = engine.send(request).await.unwrap_err();
        assert!(matches!(error, ErrorKind::CallerCancelled));
        assert_eq!(engine.stats().errors, 1);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_crashed_request_task_is_reported() {
        let server = mock_server(200).await;
        let engine = EngineBuilder::default().engine();
        engine.add_request_hook(Explode);

        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&errors);
        engine.on_error(move |_, error| {
            sink.lock().unwrap().push(error.to_string());
            Ok(())
        });
        let progress: Arc<Mutex<Option<Progress>>> = Arc::default();
        let last = Arc::clone(&progress);
        engine.on_progress(move |report| {
            *last.lock().unwrap() = Some(report.clone());
            Ok(())
        });

        engine.enqueue("batch", request(&server.uri(), 0));
        assert!(engine.run_batch("batch").await.is_empty());

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Request task failed"));
        assert_eq!(engine.stats().errors, 1);
        assert_eq!(progress.lock().unwrap().as_ref().unwrap().errors, 1);
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
