//! Offload queue tests: buffer ownership hand-off, one-shot notifications,
//! submission ordering.

mod common;

use common::*;
use pio_spi::spi::asynch::SpiQueue;
use pio_spi::spi::master::DeviceConfig;
use pio_spi::{Error, Mode};

#[test]
fn submit_notify_retrieve_roundtrip() {
    let (mut spi, _timer, _wire) = loopback();
    let dev = spi.add_device(DeviceConfig::default()).unwrap();
    let queue = SpiQueue::<_, _, _, 1>::new(spi);
    let [client] = queue.clients();

    client.begin_transaction(dev, 1_000, Mode::Mode0).unwrap();
    let rx = leak_bytes(vec![0; 4]);
    let tx = leak_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
    client.submit(Some(rx), Some(tx), 4).unwrap();

    // Not complete until the engine task runs.
    assert_eq!(client.transfer_complete(), Err(nb::Error::WouldBlock));
    assert!(queue.service());
    assert_eq!(client.transfer_complete(), Ok(()));

    let (rx, tx) = client.retrieve().unwrap();
    assert_eq!(rx.as_deref(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    assert_eq!(tx.as_deref(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));

    client.end_transaction(0).unwrap();
    queue.service();
    assert!(queue.shutdown().is_ok());
}

#[test]
fn ownership_law_is_enforced() {
    let (mut spi, _timer, _wire) = loopback();
    let dev = spi.add_device(DeviceConfig::default()).unwrap();
    let queue = SpiQueue::<_, _, _, 1>::new(spi);
    let [client] = queue.clients();

    // Nothing submitted yet: no session, no notification.
    assert_eq!(client.submit(None, None, 1), Err(Error::NoActiveSession));

    client.begin_transaction(dev, 1_000, Mode::Mode0).unwrap();
    client.submit(None, Some(leak_bytes(vec![0x55])), 1).unwrap();

    // A second submission while one is in flight violates ownership.
    assert_eq!(client.submit(None, None, 1), Err(Error::OwnershipViolation));
    // As does retrieving before the notification fired.
    assert_eq!(client.retrieve().err(), Some(Error::OwnershipViolation));

    queue.service();
    assert_eq!(client.transfer_complete(), Ok(()));
    let (rx, tx) = client.retrieve().unwrap();
    assert!(rx.is_none());
    assert_eq!(tx.as_deref(), Some(&[0x55][..]));

    // The notification was one-shot: nothing left to poll or retrieve.
    assert_eq!(
        client.transfer_complete(),
        Err(nb::Error::Other(Error::OwnershipViolation))
    );
    assert_eq!(client.retrieve().err(), Some(Error::OwnershipViolation));

    client.end_transaction(0).unwrap();
    queue.service();
}

#[test]
fn completions_follow_session_order() {
    let (mut spi, _timer, _wire) = loopback();
    let dev = spi.add_device(DeviceConfig::default()).unwrap();
    let queue = SpiQueue::<_, _, _, 2>::new(spi);
    let [a, b] = queue.clients();

    a.begin_transaction(dev, 1_000, Mode::Mode0).unwrap();
    b.begin_transaction(dev, 1_000, Mode::Mode0).unwrap();
    a.submit(None, Some(leak_bytes(vec![0x01])), 1).unwrap();
    b.submit(None, Some(leak_bytes(vec![0x02])), 1).unwrap();

    // First service grants and runs the earlier session; the later client
    // stays queued behind it.
    queue.service();
    assert_eq!(a.transfer_complete(), Ok(()));
    assert_eq!(b.transfer_complete(), Err(nb::Error::WouldBlock));

    a.retrieve().unwrap();
    a.end_transaction(0).unwrap();
    queue.service(); // closes a's session
    queue.service(); // grants and runs b's
    assert_eq!(b.transfer_complete(), Ok(()));
    b.retrieve().unwrap();
    b.end_transaction(0).unwrap();
    queue.service();

    assert!(queue.shutdown().is_ok());
}

#[test]
fn word_transfers_report_word_count() {
    let (mut spi, _timer, _wire) = loopback();
    let dev = spi.add_device(DeviceConfig::default()).unwrap();
    let queue = SpiQueue::<_, _, _, 1>::new(spi);
    let [client] = queue.clients();

    client.begin_transaction(dev, 1_000, Mode::Mode0).unwrap();
    let rx = leak_words(vec![0; 2]);
    let tx = leak_words(vec![0xdead_beef, 0x0102_0304]);
    client.submit_words(Some(rx), Some(tx), 2).unwrap();

    queue.service();
    assert_eq!(client.transfer_complete(), Ok(()));
    let (rx, _tx, nwords) = client.retrieve_words().unwrap();
    assert_eq!(nwords, 2);
    assert_eq!(rx.as_deref(), Some(&[0xdead_beef, 0x0102_0304][..]));

    client.end_transaction(0).unwrap();
    queue.service();
}

#[test]
fn rejected_session_fails_the_pending_submission() {
    let (mut spi, _timer, _wire) = loopback();
    let dev = spi.add_device(DeviceConfig::default()).unwrap();
    let queue = SpiQueue::<_, _, _, 1>::new(spi);
    let [client] = queue.clients();

    // 10 kHz is below the clocked minimum; the grant will be refused.
    client.begin_transaction(dev, 10, Mode::Mode0).unwrap();
    let tx = leak_bytes(vec![0xaa, 0xbb]);
    client.submit(None, Some(tx), 2).unwrap();

    queue.service();
    assert_eq!(
        client.transfer_complete(),
        Err(nb::Error::Other(Error::UnsupportedRate))
    );
    // The buffers come back untouched.
    let (rx, tx) = client.retrieve().unwrap();
    assert!(rx.is_none());
    assert_eq!(tx.as_deref(), Some(&[0xaa, 0xbb][..]));

    assert!(queue.shutdown().is_ok());
}

#[test]
fn shutdown_requires_a_drained_queue() {
    let (mut spi, _timer, _wire) = loopback();
    let dev = spi.add_device(DeviceConfig::default()).unwrap();
    let queue = SpiQueue::<_, _, _, 1>::new(spi);
    let [client] = queue.clients();

    client.begin_transaction(dev, 1_000, Mode::Mode0).unwrap();
    client.submit(None, Some(leak_bytes(vec![0x01])), 1).unwrap();

    // Outstanding work: shutting down now would strand the buffers.
    let queue = match queue.shutdown() {
        Err((Error::SessionInProgress, queue)) => queue,
        Err((error, _)) => panic!("unexpected error {error:?}"),
        Ok(_) => panic!("shutdown should have been refused"),
    };

    let [client] = queue.clients();
    queue.service();
    client.transfer_complete().unwrap();
    client.retrieve().unwrap();
    client.end_transaction(0).unwrap();
    queue.service();

    let mut spi = queue.shutdown().map_err(|(e, _)| e).unwrap();
    spi.shutdown().unwrap();
}
