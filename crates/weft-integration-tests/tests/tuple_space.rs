//! Integration test: the distributed tuple space.
//!
//! 1. Content round-trip: put then get by exact template
//! 2. Wildcard matching through the inverted indexes
//! 3. Non-destructive reads
//! 4. Blocking rendezvous: a get posted before the put receives the tuple
//!    directly and nothing is stored
//! 5. Listener withdrawal re-enables the storage path

use std::time::Duration;

use weft_integration_tests::{init_tracing, spawn_space_network};
use weft_space::tuple::{main_key, Namespace};
use weft_space::{PutOutcome, Template, TemplateSlot, Tuple, TupleValue, TypeTag};

fn tuple(values: Vec<TupleValue>) -> Tuple {
    Tuple::new(values)
}

fn exact_template(t: &Tuple) -> Template {
    Template::new(t.0.iter().cloned().map(TemplateSlot::Equals).collect())
}

#[tokio::test]
async fn put_then_get_round_trip() {
    init_tracing();
    let peers = spawn_space_network(3).await;

    let t = tuple(vec![
        TupleValue::Str("a".to_string()),
        TupleValue::Int(1),
        TupleValue::Float(3.14),
    ]);
    let outcome = peers[1].put(&t).await.expect("put");
    assert_eq!(outcome, PutOutcome::Stored);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let got = peers[2]
        .get_if_exists(&exact_template(&t))
        .await
        .expect("get");
    assert_eq!(got, Some(t.clone()));

    // Destructive: the tuple is gone now.
    let again = peers[0]
        .get_if_exists(&exact_template(&t))
        .await
        .expect("get");
    assert_eq!(again, None);

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn wildcard_template_finds_and_consumes() {
    init_tracing();
    let peers = spawn_space_network(3).await;

    let t = tuple(vec![TupleValue::Str("x".to_string()), TupleValue::Int(42)]);
    peers[0].put(&t).await.expect("put");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("x".to_string())),
        TemplateSlot::Any,
    ]);
    let got = peers[1].get_if_exists(&template).await.expect("get");
    assert_eq!(got, Some(t.clone()));

    // A second wildcard get on the same network finds nothing.
    let again = peers[2].get_if_exists(&template).await.expect("get");
    assert_eq!(again, None);

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn typed_template_matches_by_type() {
    init_tracing();
    let peers = spawn_space_network(3).await;

    let t = tuple(vec![
        TupleValue::Str("meter".to_string()),
        TupleValue::Int(731),
    ]);
    peers[0].put(&t).await.expect("put");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("meter".to_string())),
        TemplateSlot::OfType(TypeTag::Int),
    ]);
    let got = peers[1].read_if_exists(&template).await.expect("read");
    assert_eq!(got, Some(t.clone()));

    // The wrong type matches nothing.
    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("meter".to_string())),
        TemplateSlot::OfType(TypeTag::Str),
    ]);
    let got = peers[1].read_if_exists(&template).await.expect("read");
    assert_eq!(got, None);

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn read_leaves_the_tuple_in_place() {
    init_tracing();
    let peers = spawn_space_network(3).await;

    let t = tuple(vec![
        TupleValue::Str("persistent".to_string()),
        TupleValue::Bool(true),
    ]);
    peers[0].put(&t).await.expect("put");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("persistent".to_string())),
        TemplateSlot::Any,
    ]);
    let first = peers[1].read_if_exists(&template).await.expect("read");
    let second = peers[2].read_if_exists(&template).await.expect("read");
    assert_eq!(first, Some(t.clone()));
    assert_eq!(second, Some(t.clone()));

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn blocking_get_rendezvous_without_storage() {
    init_tracing();
    let peers = spawn_space_network(3).await;

    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("z".to_string())),
        TemplateSlot::Any,
    ]);
    let consumer = peers[1].clone();
    let waiter = tokio::spawn(async move { consumer.get(&template).await });

    // Let the listener records reach the DHT before producing.
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let t = tuple(vec![TupleValue::Str("z".to_string()), TupleValue::Int(7)]);
    let outcome = peers[2].put(&t).await.expect("put");
    assert_eq!(
        outcome,
        PutOutcome::Delivered,
        "a waiting get must receive the tuple directly"
    );

    let received = waiter.await.expect("join").expect("get");
    assert_eq!(received, t);

    // The tuple was never stored under its main key anywhere.
    let key = main_key(Namespace::Tuple, &t).expect("key");
    for peer in &peers {
        assert!(
            !peer.node().contains_local(&key),
            "rendezvous must not leave a stored tuple behind"
        );
    }

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn blocking_get_with_deterministic_template() {
    init_tracing();
    let peers = spawn_space_network(2).await;

    let t = tuple(vec![
        TupleValue::Str("ping".to_string()),
        TupleValue::Int(1),
    ]);
    let template = exact_template(&t);

    let consumer = peers[0].clone();
    let waiter = tokio::spawn(async move { consumer.get(&template).await });
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let outcome = peers[1].put(&t).await.expect("put");
    assert_eq!(outcome, PutOutcome::Delivered);
    assert_eq!(waiter.await.expect("join").expect("get"), t);

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn blocking_read_receives_a_copy_and_the_tuple_is_stored() {
    init_tracing();
    let peers = spawn_space_network(3).await;

    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("obs".to_string())),
        TemplateSlot::Any,
    ]);
    let consumer = peers[0].clone();
    let waiter = tokio::spawn(async move { consumer.read(&template).await });
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let t = tuple(vec![
        TupleValue::Str("obs".to_string()),
        TupleValue::Int(11),
    ]);
    let outcome = peers[1].put(&t).await.expect("put");
    assert_eq!(
        outcome,
        PutOutcome::DeliveredAndStored,
        "a read listener copies the tuple; the space keeps it too"
    );
    assert_eq!(waiter.await.expect("join").expect("read"), t);

    // Still retrievable afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let still_there = peers[2]
        .read_if_exists(&Template::new(vec![
            TemplateSlot::Equals(TupleValue::Str("obs".to_string())),
            TemplateSlot::Any,
        ]))
        .await
        .expect("read");
    assert_eq!(still_there, Some(t));

    for peer in &peers {
        peer.node().shutdown();
    }
}

#[tokio::test]
async fn withdrawn_listener_lets_put_store() {
    init_tracing();
    let peers = spawn_space_network(2).await;

    let template = Template::new(vec![
        TemplateSlot::Equals(TupleValue::Str("w".to_string())),
        TemplateSlot::Any,
    ]);
    let consumer = peers[0].clone();
    let blocked_template = template.clone();
    let waiter = tokio::spawn(async move { consumer.get(&blocked_template).await });
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(peers[0].waiting_requests(), 1);

    let removed = peers[0].withdraw_listener(&template).await.expect("withdraw");
    assert!(removed, "the registered listener should be found and removed");
    assert_eq!(peers[0].waiting_requests(), 0);

    // The blocked get observes the withdrawal.
    assert!(waiter.await.expect("join").is_err());

    // With the listener gone, a put proceeds to storage.
    let t = tuple(vec![TupleValue::Str("w".to_string()), TupleValue::Int(3)]);
    let outcome = peers[1].put(&t).await.expect("put");
    assert_eq!(outcome, PutOutcome::Stored);

    for peer in &peers {
        peer.node().shutdown();
    }
}
