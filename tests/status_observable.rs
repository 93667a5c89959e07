//! The "recording active" flag as seen by subscribers

use std::sync::Arc;
use std::time::Duration;

use screenrec::testing::FakeHost;
use screenrec::types::AudioMode;
use screenrec::{ScreenRecConfig, SessionController};

fn controller() -> (SessionController, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::new());
    let controller = SessionController::new(host.clone(), ScreenRecConfig::default()).unwrap();
    (controller, host)
}

#[tokio::test]
async fn subscriber_sees_start_and_stop() {
    let (controller, host) = controller();
    let mut rx = controller.subscribe();
    assert!(!*rx.borrow());

    let (auth, _) = host.authorization();
    controller.start(Box::new(auth), AudioMode::None).unwrap();
    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("start published")
        .unwrap();
    assert!(*rx.borrow_and_update());

    let stopper = controller.clone();
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .unwrap()
        .expect("teardown ran");
    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("stop published")
        .unwrap();
    assert!(!*rx.borrow_and_update());
}

#[tokio::test]
async fn failed_start_publishes_nothing() {
    let (controller, host) = controller();
    let mut rx = controller.subscribe();

    let (auth, _) = host.authorization();
    assert!(controller.start(Box::new(auth.invalid()), AudioMode::Media).is_err());

    let changed = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
    assert!(changed.is_err(), "no transition expected");
    assert_eq!(controller.status().publish_count(), 0);
}

#[test]
fn late_subscriber_reads_current_value() {
    let (controller, host) = controller();
    let (auth, _) = host.authorization();
    controller.start(Box::new(auth), AudioMode::None).unwrap();

    let rx = controller.subscribe();
    assert!(*rx.borrow());
    controller.stop().unwrap();
    assert!(!*rx.borrow());
}

#[test]
fn blocking_observer_with_tokio_test() {
    let (controller, _host) = controller();
    let mut rx = controller.subscribe();
    // Nothing published yet, so `changed` stays pending
    let mut changed = tokio_test::task::spawn(rx.changed());
    tokio_test::assert_pending!(changed.poll());
}
