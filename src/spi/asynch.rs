//! # Non-blocking transfer offload
//!
//! ## Overview
//!
//! [`SpiQueue`] wraps a master engine for clients that cannot block waiting
//! for bus access. A client opens a session with
//! [`begin_transaction`](QueueClient::begin_transaction) (which only
//! enqueues the request), hands buffer ownership to the engine with
//! [`submit`](QueueClient::submit), and gets the buffers back with
//! [`retrieve`](QueueClient::retrieve) once the one-shot completion
//! notification has fired. The engine task drives everything from
//! [`service`](SpiQueue::service).
//!
//! ## Buffer ownership
//!
//! `submit` *moves* the `&'static mut` buffer references into the queue;
//! the client cannot touch them again until `retrieve` moves them back.
//! One submission may be in flight per client at a time: a second `submit`
//! before retrieval fails with [`Error::OwnershipViolation`], as does
//! `retrieve` without a pending notification. Exactly one notification is
//! delivered per submission, in submission order.

use core::cell::RefCell;

use critical_section::Mutex;
use fugit::RateExtU32;
use heapless::Deque;
use portable_atomic::{AtomicBool, Ordering};

use super::{
    master::{DeviceId, Spi},
    Error,
    Mode,
};
use crate::{
    port::{BusPorts, ClockBlock, NoClockBlock},
    time::RefTimer,
};

/// Buffers owned by the queue while a submission is in flight.
///
/// The receive buffer is listed first, matching the order buffers are
/// handed back at retrieval.
enum Payload {
    Bytes {
        rx: Option<&'static mut [u8]>,
        tx: Option<&'static mut [u8]>,
        len: usize,
    },
    Words {
        rx: Option<&'static mut [u32]>,
        tx: Option<&'static mut [u32]>,
        nwords: usize,
    },
}

enum Work {
    None,
    Pending(Payload),
    Done {
        payload: Payload,
        transferred: usize,
    },
    Failed {
        payload: Payload,
        error: Error,
    },
}

struct Slot {
    has_session: bool,
    end_after: Option<u16>,
    work: Work,
}

struct SessionRequest {
    client: usize,
    device: DeviceId,
    speed_khz: u32,
    mode: Mode,
}

struct Inner<P, Tm, Cb, const CLIENTS: usize> {
    spi: Spi<P, Tm, Cb>,
    active: Option<usize>,
    wait_q: Deque<SessionRequest, CLIENTS>,
    slots: [Slot; CLIENTS],
}

/// Offload queue wrapping one SPI master engine for `CLIENTS` independent
/// clients.
pub struct SpiQueue<P, Tm, Cb = NoClockBlock, const CLIENTS: usize = 2> {
    inner: Mutex<RefCell<Inner<P, Tm, Cb, CLIENTS>>>,
    handles_taken: AtomicBool,
}

impl<P, Tm, Cb, const CLIENTS: usize> SpiQueue<P, Tm, Cb, CLIENTS>
where
    P: BusPorts + Send,
    Tm: RefTimer + Send,
    Cb: ClockBlock + Send,
{
    /// Wraps an engine. Devices should be registered on the engine before
    /// wrapping it.
    pub fn new(spi: Spi<P, Tm, Cb>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                spi,
                active: None,
                wait_q: Deque::new(),
                slots: core::array::from_fn(|_| Slot {
                    has_session: false,
                    end_after: None,
                    work: Work::None,
                }),
            })),
            handles_taken: AtomicBool::new(false),
        }
    }

    /// Hands out the per-client handles. May be called once.
    pub fn clients(&self) -> [QueueClient<'_, P, Tm, Cb, CLIENTS>; CLIENTS] {
        assert!(
            !self.handles_taken.swap(true, Ordering::AcqRel),
            "queue client handles already taken"
        );
        core::array::from_fn(|index| QueueClient { queue: self, index })
    }

    /// Runs the engine: grants the next queued session when the bus is
    /// idle, executes the active client's submitted transfer, fires its
    /// completion notification and processes deferred transaction ends.
    ///
    /// Called from the engine task (or interrupt context). Returns `true`
    /// when any progress was made.
    pub fn service(&self) -> bool {
        critical_section::with(|cs| {
            let inner = &mut *self.inner.borrow_ref_mut(cs);
            let mut progressed = false;

            if inner.active.is_none() {
                if let Some(req) = inner.wait_q.pop_front() {
                    match inner
                        .spi
                        .begin_session(req.device, req.speed_khz.kHz(), req.mode)
                    {
                        Ok(()) => {
                            inner.active = Some(req.client);
                        }
                        Err(error) => {
                            // The session never opened; fail any work the
                            // client queued behind it so the buffers can be
                            // reclaimed.
                            let slot = &mut inner.slots[req.client];
                            slot.has_session = false;
                            slot.end_after = None;
                            if let Work::Pending(payload) =
                                core::mem::replace(&mut slot.work, Work::None)
                            {
                                slot.work = Work::Failed { payload, error };
                            }
                            warn!("spi queue: session request rejected");
                        }
                    }
                    progressed = true;
                }
            }

            if let Some(client) = inner.active {
                match core::mem::replace(&mut inner.slots[client].work, Work::None) {
                    Work::Pending(payload) => {
                        inner.slots[client].work = execute(&mut inner.spi, payload);
                        progressed = true;
                    }
                    other => inner.slots[client].work = other,
                }

                let slot = &mut inner.slots[client];
                if !matches!(slot.work, Work::Pending(_)) {
                    if let Some(ss_deassert_ticks) = slot.end_after.take() {
                        let _ = inner.spi.finish_transaction(ss_deassert_ticks);
                        slot.has_session = false;
                        inner.active = None;
                        progressed = true;
                    }
                }
            }

            progressed
        })
    }

    /// Dissolves the queue, returning the engine.
    ///
    /// Must only be invoked once every client has ended its session and
    /// drained its notifications; anything outstanding fails with
    /// [`Error::SessionInProgress`], since tearing the queue down mid-flight
    /// would hand buffer ownership back to the wrong party.
    pub fn shutdown(self) -> Result<Spi<P, Tm, Cb>, (Error, Self)> {
        // Taking `self` by value proves no client handles are live, so the
        // handles may be taken again if the queue is handed back.
        self.handles_taken.store(false, Ordering::Release);
        let outstanding = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            inner.active.is_some()
                || !inner.wait_q.is_empty()
                || inner
                    .slots
                    .iter()
                    .any(|slot| slot.has_session || !matches!(slot.work, Work::None))
        });
        if outstanding {
            return Err((Error::SessionInProgress, self));
        }
        Ok(self.inner.into_inner().into_inner().spi)
    }
}

fn execute<P, Tm, Cb>(spi: &mut Spi<P, Tm, Cb>, payload: Payload) -> Work
where
    P: BusPorts,
    Tm: RefTimer,
    Cb: ClockBlock,
{
    match payload {
        Payload::Bytes { mut rx, mut tx, len } => {
            let result = spi.transfer_array(tx.as_deref(), rx.as_deref_mut(), len);
            let payload = Payload::Bytes { rx, tx, len };
            match result {
                Ok(()) => Work::Done {
                    payload,
                    transferred: len,
                },
                Err(error) => Work::Failed { payload, error },
            }
        }
        Payload::Words {
            mut rx,
            mut tx,
            nwords,
        } => {
            let result = spi.transfer_array_32(tx.as_deref(), rx.as_deref_mut(), nwords);
            let payload = Payload::Words { rx, tx, nwords };
            match result {
                Ok(()) => Work::Done {
                    payload,
                    transferred: nwords,
                },
                Err(error) => Work::Failed { payload, error },
            }
        }
    }
}

/// One client's handle onto a [`SpiQueue`].
pub struct QueueClient<'q, P, Tm, Cb, const CLIENTS: usize> {
    queue: &'q SpiQueue<P, Tm, Cb, CLIENTS>,
    index: usize,
}

impl<P, Tm, Cb, const CLIENTS: usize> QueueClient<'_, P, Tm, Cb, CLIENTS>
where
    P: BusPorts + Send,
    Tm: RefTimer + Send,
    Cb: ClockBlock + Send,
{
    fn with_slot<R>(&self, f: impl FnOnce(&mut Inner<P, Tm, Cb, CLIENTS>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.queue.inner.borrow_ref_mut(cs)))
    }

    /// Requests a session with `device` at `speed_khz` in `mode`. Returns
    /// immediately; the session opens, in request order, once the bus is
    /// idle. Transfers submitted in the meantime run as soon as it does.
    pub fn begin_transaction(
        &self,
        device: DeviceId,
        speed_khz: u32,
        mode: Mode,
    ) -> Result<(), Error> {
        self.with_slot(|inner| {
            if inner.slots[self.index].has_session {
                return Err(Error::SessionInProgress);
            }
            inner.slots[self.index].has_session = true;
            // One request per client, so the queue can never overflow.
            let pushed = inner
                .wait_q
                .push_back(SessionRequest {
                    client: self.index,
                    device,
                    speed_khz,
                    mode,
                })
                .is_ok();
            debug_assert!(pushed);
            Ok(())
        })
    }

    /// Submits a byte transfer, moving ownership of both buffers to the
    /// engine. `rx` is filled from the bus, `tx` is transmitted; either may
    /// be `None`. The caller must not touch the buffers again until
    /// [`retrieve`](Self::retrieve).
    pub fn submit(
        &self,
        rx: Option<&'static mut [u8]>,
        tx: Option<&'static mut [u8]>,
        len: usize,
    ) -> Result<(), Error> {
        self.submit_payload(Payload::Bytes { rx, tx, len })
    }

    /// Submits a 32-bit word transfer. Words travel in memory order.
    pub fn submit_words(
        &self,
        rx: Option<&'static mut [u32]>,
        tx: Option<&'static mut [u32]>,
        nwords: usize,
    ) -> Result<(), Error> {
        self.submit_payload(Payload::Words { rx, tx, nwords })
    }

    fn submit_payload(&self, payload: Payload) -> Result<(), Error> {
        self.with_slot(|inner| {
            let slot = &mut inner.slots[self.index];
            if !slot.has_session {
                return Err(Error::NoActiveSession);
            }
            if !matches!(slot.work, Work::None) {
                return Err(Error::OwnershipViolation);
            }
            slot.work = Work::Pending(payload);
            Ok(())
        })
    }

    /// Polls the one-shot completion notification for the last submission.
    ///
    /// Returns [`nb::Error::WouldBlock`] while the transfer is in flight.
    /// A failed session request surfaces here as the rejection error. With
    /// nothing submitted this is a contract violation.
    pub fn transfer_complete(&self) -> nb::Result<(), Error> {
        self.with_slot(|inner| match &inner.slots[self.index].work {
            Work::Pending(_) => Err(nb::Error::WouldBlock),
            Work::Done { .. } => Ok(()),
            Work::Failed { error, .. } => Err(nb::Error::Other(*error)),
            Work::None => Err(nb::Error::Other(Error::OwnershipViolation)),
        })
    }

    /// Reclaims ownership of the byte buffers handed over at
    /// [`submit`](Self::submit), clearing the notification. Must only be
    /// called after [`transfer_complete`](Self::transfer_complete) stopped
    /// returning `WouldBlock`.
    #[allow(clippy::type_complexity)]
    pub fn retrieve(
        &self,
    ) -> Result<(Option<&'static mut [u8]>, Option<&'static mut [u8]>), Error> {
        self.with_slot(|inner| {
            let slot = &mut inner.slots[self.index];
            match core::mem::replace(&mut slot.work, Work::None) {
                Work::Done {
                    payload: Payload::Bytes { rx, tx, .. },
                    ..
                }
                | Work::Failed {
                    payload: Payload::Bytes { rx, tx, .. },
                    ..
                } => Ok((rx, tx)),
                other => {
                    slot.work = other;
                    Err(Error::OwnershipViolation)
                }
            }
        })
    }

    /// Reclaims the word buffers handed over at
    /// [`submit_words`](Self::submit_words), reporting how many words were
    /// transferred.
    #[allow(clippy::type_complexity)]
    pub fn retrieve_words(
        &self,
    ) -> Result<(Option<&'static mut [u32]>, Option<&'static mut [u32]>, usize), Error> {
        self.with_slot(|inner| {
            let slot = &mut inner.slots[self.index];
            match core::mem::replace(&mut slot.work, Work::None) {
                Work::Done {
                    payload: Payload::Words { rx, tx, .. },
                    transferred,
                } => Ok((rx, tx, transferred)),
                Work::Failed {
                    payload: Payload::Words { rx, tx, .. },
                    ..
                } => Ok((rx, tx, 0)),
                other => {
                    slot.work = other;
                    Err(Error::OwnershipViolation)
                }
            }
        })
    }

    /// Ends the client's session, with the same de-assert semantics as
    /// [`Transaction::end`](super::master::Transaction::end). Deferred
    /// until any in-flight submission completes.
    pub fn end_transaction(&self, ss_deassert_ticks: u16) -> Result<(), Error> {
        self.with_slot(|inner| {
            let slot = &mut inner.slots[self.index];
            if !slot.has_session {
                return Err(Error::NoActiveSession);
            }
            slot.end_after = Some(ss_deassert_ticks);
            Ok(())
        })
    }
}
