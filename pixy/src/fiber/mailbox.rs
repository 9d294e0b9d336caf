//! Unbuffered rendezvous channel between fibers.
//!
//! A mailbox carries values directly from the sender's stack frame to the
//! receiver. [`Mailbox::put`] blocks the sender until a receiver has not
//! only taken the mail but *released* it by dropping the [`Mail`] guard;
//! until then the value lives in the sender's frame and the guard borrows
//! it. This gives every transfer a full handshake: one `put`, one `get`,
//! one guard drop, in that order.
//!
//! Waiting senders and waiting receivers each form a LIFO stack; a mailbox
//! never holds both at once.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr;

use crate::runtime;
use crate::sched::FiberRef;

struct WaitingWriter<T> {
    prev: *mut WaitingWriter<T>,
    fiber: FiberRef,
    value: Option<T>,
}

struct WaitingReader<T> {
    prev: *mut WaitingReader<T>,
    fiber: FiberRef,
    mail: *mut WaitingWriter<T>,
}

/// Rendezvous point for handing values between fibers. Share it with `Rc`.
///
/// ```
/// use std::rc::Rc;
/// use pixy::fiber::{self, Mailbox};
///
/// pixy::run(|| {
///     let mailbox = Rc::new(Mailbox::new());
///     let mb = Rc::clone(&mailbox);
///     fiber::start(move || {
///         for i in 1..=3 {
///             mb.put(i);
///         }
///     });
///     let mut sum = 0;
///     for _ in 0..3 {
///         sum += mailbox.get().take();
///     }
///     assert_eq!(sum, 6);
///     0
/// });
/// ```
pub struct Mailbox<T> {
    last_reader: Cell<*mut WaitingReader<T>>,
    last_writer: Cell<*mut WaitingWriter<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Mailbox<T> {
        Mailbox {
            last_reader: Cell::new(ptr::null_mut()),
            last_writer: Cell::new(ptr::null_mut()),
        }
    }

    /// Hands `value` to a receiver and waits for the full handshake: the
    /// call returns once the receiver has dropped (or consumed) the
    /// [`Mail`] guard.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn put(&self, value: T) {
        let rt = runtime::current();
        let mut writer = WaitingWriter {
            prev: ptr::null_mut(),
            fiber: rt.sched.current(),
            value: Some(value),
        };

        let reader = self.last_reader.get();
        if !reader.is_null() {
            let reader = unsafe { &mut *reader };
            self.last_reader.set(reader.prev);
            reader.mail = &mut writer;
            rt.sched.resume(reader.fiber);
        } else {
            writer.prev = self.last_writer.replace(&mut writer);
        }

        // Resumed by the Mail guard once the receiver is done with the
        // value; an untaken value is dropped here with the frame.
        rt.sched.suspend_current();
    }

    /// Receives mail, waiting for a sender if none is pending.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn get(&self) -> Mail<'_, T> {
        if let Some(mail) = self.try_get() {
            return mail;
        }

        let rt = runtime::current();
        let mut reader = WaitingReader {
            prev: self.last_reader.get(),
            fiber: rt.sched.current(),
            mail: ptr::null_mut(),
        };
        self.last_reader.set(&mut reader);
        rt.sched.suspend_current();
        debug_assert!(!reader.mail.is_null());
        Mail {
            writer: reader.mail,
            _mailbox: PhantomData,
        }
    }

    /// Receives mail only if a sender is already waiting.
    pub fn try_get(&self) -> Option<Mail<'_, T>> {
        let writer = self.last_writer.get();
        if writer.is_null() {
            return None;
        }
        self.last_writer.set(unsafe { (*writer).prev });
        Some(Mail {
            writer,
            _mailbox: PhantomData,
        })
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Mailbox<T> {
        Mailbox::new()
    }
}

/// Mail in the receiver's hands.
///
/// Borrows the value still stored in the sender's frame; the sender stays
/// suspended until this guard goes away. [`Mail::take`] moves the value
/// out, plain `Deref` reads it in place; either way, dropping the guard
/// completes the handshake and resumes the sender.
pub struct Mail<'a, T> {
    writer: *mut WaitingWriter<T>,
    _mailbox: PhantomData<&'a Mailbox<T>>,
}

impl<'a, T> Mail<'a, T> {
    /// Moves the value out, releasing the sender.
    pub fn take(self) -> T {
        let value = unsafe { (*self.writer).value.take() };
        value.expect("mail already taken")
        // Drop of `self` resumes the sender.
    }
}

impl<'a, T> Deref for Mail<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { (*self.writer).value.as_ref() }.expect("mail already taken")
    }
}

impl<'a, T> Drop for Mail<'a, T> {
    fn drop(&mut self) {
        let fiber = unsafe { (*self.writer).fiber };
        runtime::current().sched.resume(fiber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn values_arrive_in_order() {
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = Rc::clone(&got);
        crate::run(move || {
            let mailbox: Rc<Mailbox<Option<i32>>> = Rc::new(Mailbox::new());
            let mb = Rc::clone(&mailbox);
            crate::fiber::start(move || {
                for i in 1..=5 {
                    mb.put(Some(i));
                }
                mb.put(None);
            });
            loop {
                let mail = mailbox.get();
                match *mail {
                    Some(i) => g.borrow_mut().push(i),
                    None => break,
                }
            }
            0
        });
        assert_eq!(*got.borrow(), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn sender_stays_blocked_until_mail_is_released() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let mailbox = Rc::new(Mailbox::new());
            let mb = Rc::clone(&mailbox);
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || {
                mb.put(42);
                t2.borrow_mut().push("sender released");
            });
            let mail = mailbox.get();
            t.borrow_mut().push("received");
            crate::fiber::reschedule();
            // The sender cannot have resumed: the guard is still alive.
            t.borrow_mut().push("still holding");
            assert_eq!(mail.take(), 42);
            crate::fiber::reschedule();
            0
        });
        assert_eq!(
            *trace.borrow(),
            ["received", "still holding", "sender released"]
        );
    }

    #[test]
    fn try_get_returns_nothing_without_a_sender() {
        crate::run(|| {
            let mailbox: Mailbox<i32> = Mailbox::new();
            assert!(mailbox.try_get().is_none());
            0
        });
    }

    #[test]
    fn reader_blocks_until_a_writer_shows_up() {
        let got = Rc::new(RefCell::new(None));
        let g = Rc::clone(&got);
        crate::run(move || {
            let mailbox = Rc::new(Mailbox::<&str>::new());
            let mb = Rc::clone(&mailbox);
            let g2 = Rc::clone(&g);
            crate::fiber::start(move || {
                *g2.borrow_mut() = Some(mb.get().take());
            });
            assert!(g.borrow().is_none());
            mailbox.put("ping");
            0
        });
        assert_eq!(*got.borrow(), Some("ping"));
    }

    #[test]
    fn untaken_mail_is_dropped_in_the_sender() {
        // Dropping the guard without taking releases the sender, which then
        // drops the value in its own frame.
        let dropped = Rc::new(RefCell::new(0));

        struct Tally(Rc<RefCell<i32>>);
        impl Drop for Tally {
            fn drop(&mut self) {
                *self.0.borrow_mut() += 1;
            }
        }

        let d = Rc::clone(&dropped);
        crate::run(move || {
            let mailbox = Rc::new(Mailbox::new());
            let mb = Rc::clone(&mailbox);
            let d2 = Rc::clone(&d);
            crate::fiber::start(move || {
                mb.put(Tally(d2));
            });
            let mail = mailbox.get();
            drop(mail);
            assert_eq!(*d.borrow(), 0); // sender not yet resumed
            crate::fiber::reschedule();
            assert_eq!(*d.borrow(), 1);
            0
        });
        assert_eq!(*dropped.borrow(), 1);
    }
}
