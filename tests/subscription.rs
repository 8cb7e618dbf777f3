mod common;

use common::*;
use tinymq::{
    packets::Packet, Config, ConnectReturnCode, EncodeError, Error, OperationError,
    OperationKind, QoS, TopicFilter,
};

#[test]
fn incoming_at_most_once() {
    let (mut mqtt, _clock) = connected(Config::new());

    deliver(
        &mut mqtt,
        &publish("a/b", b"hello", QoS::AtMostOnce, None, false),
    );
    assert!(sent(&mut mqtt).is_empty());
    assert_eq!(
        mqtt.client().handler().messages,
        [Received {
            topic: "a/b".into(),
            payload: b"hello".to_vec(),
            qos: QoS::AtMostOnce,
            dup: false,
        }]
    );
}

#[test]
fn incoming_at_least_once() {
    let (mut mqtt, _clock) = connected(Config::new());

    deliver(
        &mut mqtt,
        &publish("a/b", b"hello", QoS::AtLeastOnce, Some(7), false),
    );
    assert_eq!(sent(&mut mqtt), puback(7));
    assert_eq!(mqtt.client().handler().messages.len(), 1);
}

#[test]
fn incoming_exactly_once_is_delivered_once() {
    let (mut mqtt, _clock) = connected(Config::new());

    deliver(
        &mut mqtt,
        &publish("a/b", b"hello", QoS::ExactlyOnce, Some(9), false),
    );
    assert_eq!(sent(&mut mqtt), pubrec(9));
    assert!(mqtt.client().handler().messages.is_empty());

    // The broker did not see the PUBREC and retransmits.
    deliver(
        &mut mqtt,
        &publish("a/b", b"hello", QoS::ExactlyOnce, Some(9), true),
    );
    assert_eq!(sent(&mut mqtt), pubrec(9));
    assert!(mqtt.client().handler().messages.is_empty());

    deliver(&mut mqtt, &pubrel(9));
    assert_eq!(sent(&mut mqtt), pubcomp(9));
    assert_eq!(
        mqtt.client().handler().messages,
        [Received {
            topic: "a/b".into(),
            payload: b"hello".to_vec(),
            qos: QoS::ExactlyOnce,
            dup: false,
        }]
    );

    // A repeated release is completed without delivering again.
    deliver(&mut mqtt, &pubrel(9));
    assert_eq!(sent(&mut mqtt), pubcomp(9));
    assert_eq!(mqtt.client().handler().messages.len(), 1);
}

#[test]
fn several_packets_in_one_read() {
    let (mut mqtt, _clock) = connected(Config::new());

    let mut data = publish("a/b", b"one", QoS::AtMostOnce, None, false);
    data.extend(publish("a/b", b"two", QoS::AtLeastOnce, Some(1), false));
    data.extend(pingresp());
    deliver(&mut mqtt, &data);

    let messages = &mqtt.client().handler().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].payload, b"one");
    assert_eq!(messages[1].payload, b"two");
}

#[test]
fn packets_split_across_reads() {
    let (mut mqtt, _clock) = connected(Config::new());

    let data = publish("a/b", b"hello", QoS::AtMostOnce, None, false);
    for byte in data.iter() {
        deliver(&mut mqtt, &[*byte]);
    }

    assert_eq!(mqtt.client().handler().messages.len(), 1);
}

#[test]
fn subscription_callbacks() {
    let (mut mqtt, _clock) = connected(Config::new());

    let filters = [TopicFilter::new("sensors/+").qos(QoS::AtLeastOnce)];
    let handle = mqtt
        .client()
        .subscribe(&filters, Some(Recorder::route))
        .unwrap();
    mqtt.poll().unwrap();

    let data = sent(&mut mqtt);
    match packets(&data)[..] {
        [Packet::Subscribe(subscribe)] => {
            assert_eq!(subscribe.packet_id, 1);
            let requested: Vec<_> = subscribe.topics.iter().collect();
            assert_eq!(requested, filters);
        }
        _ => panic!("Expected a single SUBSCRIBE"),
    }

    // Not active until granted.
    assert!(!mqtt.client().is_subscribed("sensors/+"));
    deliver(&mut mqtt, &suback(1, &[0x01]));
    assert!(mqtt.client().is_subscribed("sensors/+"));

    let completion = mqtt.client().handler().completions[0];
    assert_eq!(completion.handle, handle);
    assert_eq!(completion.kind, OperationKind::Subscribe);
    assert_eq!(completion.result, Ok(()));

    deliver(
        &mut mqtt,
        &publish("sensors/temperature", b"21", QoS::AtMostOnce, None, false),
    );
    deliver(&mut mqtt, &publish("other", b"x", QoS::AtMostOnce, None, false));

    let handler = mqtt.client().handler();
    assert_eq!(handler.routed.len(), 1);
    assert_eq!(handler.routed[0].topic, "sensors/temperature");
    assert_eq!(handler.messages.len(), 1);
    assert_eq!(handler.messages[0].topic, "other");
}

#[test]
fn refused_filters() {
    let (mut mqtt, _clock) = connected(Config::new());

    mqtt.client()
        .subscribe(&[TopicFilter::new("a"), TopicFilter::new("b")], None)
        .unwrap();
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &suback(1, &[0x00, 0x80]));

    assert!(mqtt.client().is_subscribed("a"));
    assert!(!mqtt.client().is_subscribed("b"));
    assert_eq!(
        mqtt.client().handler().completions[0].result,
        Err(OperationError::SubscriptionRefused)
    );
}

#[test]
fn unsubscribe() {
    let (mut mqtt, _clock) = connected(Config::new());

    mqtt.client()
        .subscribe(&[TopicFilter::new("a/#")], Some(Recorder::route))
        .unwrap();
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &suback(1, &[0x00]));
    sent(&mut mqtt);

    let handle = mqtt.client().unsubscribe(&["a/#"]).unwrap();
    assert!(!mqtt.client().is_subscribed("a/#"));

    mqtt.poll().unwrap();
    let data = sent(&mut mqtt);
    match packets(&data)[..] {
        [Packet::Unsubscribe(unsubscribe)] => assert_eq!(unsubscribe.packet_id, 2),
        _ => panic!("Expected a single UNSUBSCRIBE"),
    }

    // Messages in flight are no longer routed to the subscription.
    deliver(&mut mqtt, &publish("a/b", b"x", QoS::AtMostOnce, None, false));
    assert!(mqtt.client().handler().routed.is_empty());
    assert_eq!(mqtt.client().handler().messages.len(), 1);

    deliver(&mut mqtt, &unsuback(2));
    let completion = mqtt.client().handler().completions[1];
    assert_eq!(completion.handle, handle);
    assert_eq!(completion.kind, OperationKind::Unsubscribe);
    assert_eq!(completion.result, Ok(()));
}

#[test]
fn invalid_filters() {
    let (mut mqtt, _clock) = connected(Config::new());

    assert_eq!(
        mqtt.client().subscribe(&[TopicFilter::new("a/#/b")], None),
        Err(Error::Encode(EncodeError::InvalidField))
    );
    assert_eq!(
        mqtt.client().subscribe(&[], None),
        Err(Error::Encode(EncodeError::InvalidField))
    );
    assert_eq!(
        mqtt.client().unsubscribe(&["a+"]),
        Err(Error::Encode(EncodeError::InvalidField))
    );
    assert_eq!(mqtt.client().pending_operations(), 0);
}

#[test]
fn subscription_timeout() {
    let (mut mqtt, clock) = connected(Config::new());

    mqtt.client()
        .subscribe(&[TopicFilter::new("a")], None)
        .unwrap();
    mqtt.poll().unwrap();

    clock.advance(1000);
    mqtt.poll().unwrap();
    assert_eq!(
        mqtt.client().handler().completions[0].result,
        Err(OperationError::Timeout)
    );

    // A late SUBACK does not resurrect the subscription.
    deliver(&mut mqtt, &suback(1, &[0x00]));
    assert!(!mqtt.client().is_subscribed("a"));
    assert!(mqtt.client().is_connected());
}

#[test]
fn renewal_keeps_the_active_subscription() {
    let (mut mqtt, clock) = connected(Config::new());

    mqtt.client()
        .subscribe(&[TopicFilter::new("a/b")], Some(Recorder::route))
        .unwrap();
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &suback(1, &[0x00]));

    mqtt.client()
        .subscribe(&[TopicFilter::new("a/b").qos(QoS::AtLeastOnce)], None)
        .unwrap();
    mqtt.poll().unwrap();
    assert!(mqtt.client().is_subscribed("a/b"));

    deliver(&mut mqtt, &publish("a/b", b"1", QoS::AtMostOnce, None, false));
    assert_eq!(mqtt.client().handler().routed.len(), 1);

    // The broker never answers the renewal.
    clock.advance(1000);
    mqtt.poll().unwrap();
    assert_eq!(
        mqtt.client().handler().completions[1].result,
        Err(OperationError::Timeout)
    );
    assert!(mqtt.client().is_subscribed("a/b"));

    deliver(&mut mqtt, &publish("a/b", b"2", QoS::AtMostOnce, None, false));
    let handler = mqtt.client().handler();
    assert_eq!(handler.routed.len(), 2);
    assert!(handler.messages.is_empty());
}

#[test]
fn persistent_session_keeps_subscriptions() {
    let (mut mqtt, _clock) = connected(Config::new().clean_session(false));

    mqtt.client()
        .subscribe(&[TopicFilter::new("a/#")], Some(Recorder::route))
        .unwrap();
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &suback(1, &[0x01]));
    sent(&mut mqtt);

    mqtt.client().transport_mut().broken = true;
    assert!(mqtt.poll().is_err());
    assert!(!mqtt.client().is_subscribed("a/#"));
    mqtt.client().transport_mut().broken = false;

    mqtt.client().connect().unwrap();
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &resumed_connack());
    assert!(mqtt.client().session_present());
    assert!(mqtt.client().is_subscribed("a/#"));

    deliver(&mut mqtt, &publish("a/b", b"x", QoS::AtMostOnce, None, false));
    assert_eq!(mqtt.client().handler().routed.len(), 1);
}

#[test]
fn restored_subscriptions() {
    let (mut mqtt, _clock) = engine(Config::new().clean_session(false));

    let filters = [TopicFilter::new("a/+").qos(QoS::AtLeastOnce)];
    assert_eq!(
        mqtt.client()
            .restore_subscriptions(&[TopicFilter::new("a/#/b")], None),
        Err(Error::Encode(EncodeError::InvalidField))
    );
    mqtt.client()
        .restore_subscriptions(&filters, Some(Recorder::route))
        .unwrap();
    assert!(!mqtt.client().is_subscribed("a/+"));

    mqtt.client().connect().unwrap();
    assert_eq!(
        mqtt.client().restore_subscriptions(&filters, None),
        Err(Error::NotReady)
    );
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &resumed_connack());

    // Nothing is sent to re-establish a subscription the broker already holds.
    let data = sent(&mut mqtt);
    assert!(matches!(packets(&data)[..], [Packet::Connect(_)]));
    assert!(mqtt.client().is_subscribed("a/+"));

    deliver(&mut mqtt, &publish("a/b", b"x", QoS::AtMostOnce, None, false));
    assert_eq!(mqtt.client().handler().routed.len(), 1);
}

#[test]
fn restored_subscriptions_need_a_resumed_session() {
    let (mut mqtt, _clock) = engine(Config::new().clean_session(false));

    mqtt.client()
        .restore_subscriptions(&[TopicFilter::new("a/+")], Some(Recorder::route))
        .unwrap();
    mqtt.client().connect().unwrap();
    mqtt.poll().unwrap();
    deliver(&mut mqtt, &connack(ConnectReturnCode::Accepted));
    assert!(mqtt.client().is_connected());
    assert!(!mqtt.client().is_subscribed("a/+"));

    deliver(&mut mqtt, &publish("a/b", b"x", QoS::AtMostOnce, None, false));
    let handler = mqtt.client().handler();
    assert!(handler.routed.is_empty());
    assert_eq!(handler.messages.len(), 1);
}
