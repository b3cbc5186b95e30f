//! Rendezvous channels. Send/receive pairs match FIFO: a send finding a
//! waiting receiver hands the value off directly and readies both fibers in
//! that order; otherwise the sender parks on the channel's waiter queue.

use std::collections::VecDeque;

use object::{Header, HeaderFlags, ObjRef, ObjectKind, Slot};

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{alloc_fixed, Channel};
use crate::runtime::object_lock;

pub fn new_channel(fbr: &mut Fiber) -> Slot {
    let r = alloc_fixed(
        fbr.allocator(),
        true,
        true,
        Channel {
            header: Header::with_flags(ObjectKind::Channel, HeaderFlags::FINALIZER),
            receivers: VecDeque::new(),
            senders: VecDeque::new(),
        },
    )
    .expect("shared heap exhausted creating channel");
    Slot::Ref(r)
}

fn channel_arg(frame: &Frame<'_>) -> Option<ObjRef> {
    frame
        .arg(1)
        .as_ref()
        .filter(|r| r.kind() == ObjectKind::Channel)
}

pub extern "C" fn bi_channel(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().channel;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(0) {
        return code;
    }
    let chan = new_channel(frame.fbr);
    frame.result(chan)
}

pub extern "C" fn bi_send(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().send;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    let Some(chan) = channel_arg(&frame) else {
        return frame.bad_dispatch();
    };
    if let Err(code) = frame.require_argc(2) {
        return code;
    }
    let value = frame.arg(2);

    frame.cc_resume(Box::new(move |fbr: &mut Fiber| {
        // the value escapes this fiber; promote before another fiber can
        // observe it
        let mut value = value;
        fbr.allocator().share(&mut value);

        let _guard = object_lock(chan.as_ptr() as *const u8).lock();
        // SAFETY: channel mutation happens under the object lock.
        let chan = unsafe { chan.cast_mut::<Channel>() };
        if let Some(receiver) = chan.receivers.pop_front() {
            let r = receiver.as_ref().expect("receiver is a fiber");
            // SAFETY: waiting fibers stay alive through the channel and the
            // runtime's fiber lists.
            let receiver_fbr = unsafe { &mut *(r.as_ptr() as *mut Fiber) };
            receiver_fbr.resume_async(move |f| f.stack.push(value), 0);
            fbr.stack.push(value);
            true // hand-off complete, resume with the value
        } else {
            chan.senders
                .push_back((Slot::Ref(fbr.self_ref()), value));
            false // no counterparty, park
        }
    }))
}

pub extern "C" fn bi_recv(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().recv;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    let Some(chan) = channel_arg(&frame) else {
        return frame.bad_dispatch();
    };
    if let Err(code) = frame.require_argc(1) {
        return code;
    }

    frame.cc_resume(Box::new(move |fbr: &mut Fiber| {
        let _guard = object_lock(chan.as_ptr() as *const u8).lock();
        // SAFETY: channel mutation happens under the object lock.
        let chan = unsafe { chan.cast_mut::<Channel>() };
        if let Some((sender, value)) = chan.senders.pop_front() {
            fbr.stack.push(value);
            let r = sender.as_ref().expect("sender is a fiber");
            // SAFETY: as in bi_send.
            let sender_fbr = unsafe { &mut *(r.as_ptr() as *mut Fiber) };
            sender_fbr.resume_async(move |f| f.stack.push(value), 0);
            true // value taken, resume with it
        } else {
            chan.receivers.push_back(Slot::Ref(fbr.self_ref()));
            false // no sender yet, park
        }
    }))
}
