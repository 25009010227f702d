//! `HttpFileSource` over real sockets against a mock server.
//!
//! The run loop lives on a blocking thread; the tokio test runtime only hosts
//! the mock server.

use futures::channel::oneshot;
use mini_runloop::{
    Body, FetchResult, FileSource, HttpConfig, HttpFileSource, Resource, ResponseError, RunLoop,
    Timer,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn fetch(resource: Resource) -> FetchResult {
    tokio::task::spawn_blocking(move || {
        let run_loop = RunLoop::new().unwrap();
        let source = HttpFileSource::with_config(&run_loop, HttpConfig::default()).unwrap();
        let (tx, rx) = oneshot::channel();

        let _request = source.request(
            resource,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        run_loop.block_on(rx).expect("callback dropped without firing")
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn delivers_body_and_validators() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/style.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"version\":8}")
                .insert_header("ETag", "\"v1\"")
                .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = fetch(Resource::style(format!("{}/style.json", server.uri())))
        .await
        .unwrap();

    assert_eq!(response.body, Body::Data(b"{\"version\":8}".to_vec()));
    assert_eq!(response.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        response.modified.as_deref(),
        Some("Wed, 21 Oct 2015 07:28:00 GMT")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn conditional_request_reports_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tiles/1/0/0.pbf"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let resource =
        Resource::tile(format!("{}/tiles/1/0/0.pbf", server.uri())).with_prior_etag("\"v1\"");
    let response = fetch(resource).await.unwrap();

    assert!(response.is_not_modified());
}

#[tokio::test(flavor = "multi_thread")]
async fn maps_error_statuses() {
    let server = MockServer::start().await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/teapot"))
        .respond_with(ResponseTemplate::new(418))
        .mount(&server)
        .await;

    let missing = fetch(Resource::tile(format!("{}/missing", server.uri()))).await;
    let busy = fetch(Resource::tile(format!("{}/busy", server.uri()))).await;
    let teapot = fetch(Resource::tile(format!("{}/teapot", server.uri()))).await;

    assert_eq!(missing, Err(ResponseError::NotFound));
    assert_eq!(busy, Err(ResponseError::Server { status: 503 }));
    assert_eq!(teapot, Err(ResponseError::UnexpectedStatus(418)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_host_is_a_connection_error() {
    // Nothing listens on the discard port on loopback.
    let result = fetch(Resource::glyphs("http://127.0.0.1:9/fonts/0-255.pbf")).await;

    assert!(
        matches!(result, Err(ResponseError::Connection(_))),
        "{result:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn every_request_is_answered_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tile"))
        .expect(8)
        .mount(&server)
        .await;
    let base = server.uri();

    let delivered = tokio::task::spawn_blocking(move || {
        let run_loop = RunLoop::new().unwrap();
        let source = HttpFileSource::with_config(&run_loop, HttpConfig::default()).unwrap();
        let delivered = Rc::new(RefCell::new(Vec::new()));

        let requests: Vec<_> = (0..8)
            .map(|i| {
                let delivered = delivered.clone();
                let run_loop = run_loop.clone();
                source.request(
                    Resource::tile(format!("{base}/tiles/{i}.pbf")),
                    Box::new(move |result| {
                        assert!(result.is_ok(), "{result:?}");
                        delivered.borrow_mut().push(i);
                        if delivered.borrow().len() == 8 {
                            run_loop.stop();
                        }
                    }),
                )
            })
            .collect();

        run_loop.run();
        drop(requests);
        let mut delivered = delivered.borrow().clone();
        delivered.sort_unstable();
        delivered
    })
    .await
    .unwrap();

    assert_eq!(delivered, (0..8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_request_never_calls_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;
    let url = format!("{}/slow", server.uri());

    let called = tokio::task::spawn_blocking(move || {
        let run_loop = RunLoop::new().unwrap();
        let source = HttpFileSource::with_config(&run_loop, HttpConfig::default()).unwrap();
        let called = Rc::new(RefCell::new(false));

        let flag = called.clone();
        let request = source.request(
            Resource::tile(url),
            Box::new(move |_| *flag.borrow_mut() = true),
        );
        drop(request);
        assert_eq!(source.in_flight(), 0);

        let finisher = Timer::new(&run_loop);
        let handle = run_loop.clone();
        finisher.start(Duration::from_millis(300), Duration::ZERO, move || {
            handle.stop()
        });
        run_loop.run();

        let called = *called.borrow();
        called
    })
    .await
    .unwrap();

    assert!(!called);
}
