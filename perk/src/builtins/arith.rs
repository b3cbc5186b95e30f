//! Binary-dispatch arithmetic and comparison over the numeric kinds and
//! strings. Integer arithmetic wraps modulo 2^64.

use object::Slot;

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{eq_value, new_str, Str};

enum Num {
    Int(i64),
    Float(f64),
}

fn num(slot: Slot) -> Option<Num> {
    match slot {
        Slot::Int(i) => Some(Num::Int(i)),
        Slot::Float(f) => Some(Num::Float(f)),
        _ => None,
    }
}

fn numeric_frame<'a>(
    fbr: &'a mut Fiber,
    apply: &'a Apply,
    expected: object::ObjRef,
) -> Result<(Frame<'a>, Num, Num), Frame<'a>> {
    let frame = Frame::new(fbr, apply);
    if !frame.matches_static(expected) || frame.argc() != 2 {
        return Err(frame);
    }
    match (num(frame.arg(1)), num(frame.arg(2))) {
        (Some(a), Some(b)) => Ok((frame, a, b)),
        _ => Err(frame),
    }
}

macro_rules! numeric_op {
    ($name:ident, $wk:ident, $int:expr, $float:expr) => {
        pub extern "C" fn $name(fbr: *mut Fiber, apply: *const Apply) -> i64 {
            // SAFETY: called from compiled code with live fiber and node.
            let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
            let expected = fbr.runtime.wk().$wk;
            match numeric_frame(fbr, apply, expected) {
                Ok((mut frame, a, b)) => {
                    let result = match (a, b) {
                        (Num::Int(x), Num::Int(y)) => $int(&mut frame, x, y),
                        (Num::Int(x), Num::Float(y)) => $float(x as f64, y),
                        (Num::Float(x), Num::Int(y)) => $float(x, y as f64),
                        (Num::Float(x), Num::Float(y)) => $float(x, y),
                    };
                    match result {
                        Ok(slot) => frame.result(slot),
                        Err(code) => code,
                    }
                }
                Err(mut frame) => frame.bad_dispatch(),
            }
        }
    };
}

type OpResult = Result<Slot, i64>;

fn ok(slot: impl Into<Slot>) -> OpResult {
    Ok(slot.into())
}

numeric_op!(bi_add_num, add, |_f: &mut Frame<'_>, x: i64, y: i64| ok(
    x.wrapping_add(y)
), |x: f64, y: f64| ok(x + y));

numeric_op!(bi_sub_num, subtract, |_f: &mut Frame<'_>, x: i64, y: i64| ok(
    x.wrapping_sub(y)
), |x: f64, y: f64| ok(x - y));

numeric_op!(bi_mul_num, multiply, |_f: &mut Frame<'_>, x: i64, y: i64| ok(
    x.wrapping_mul(y)
), |x: f64, y: f64| ok(x * y));

numeric_op!(
    bi_mod_num,
    modulo,
    |frame: &mut Frame<'_>, x: i64, y: i64| {
        if y == 0 {
            Err(frame.raise("division-by-zero", "modulo by zero"))
        } else {
            ok(x.wrapping_rem(y))
        }
    },
    |x: f64, y: f64| ok(x % y)
);

numeric_op!(bi_lt_num, lessthan, |_f: &mut Frame<'_>, x: i64, y: i64| ok(
    x < y
), |x: f64, y: f64| ok(x < y));

numeric_op!(bi_gt_num, greaterthan, |_f: &mut Frame<'_>, x: i64, y: i64| ok(
    x > y
), |x: f64, y: f64| ok(x > y));

// ── equality over every kind pair ─────────────────────────────────────

pub extern "C" fn bi_equals(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let expected = fbr.runtime.wk().equals;
    let mut frame = Frame::new(fbr, apply);
    if !frame.matches_static(expected) || frame.argc() != 2 {
        return frame.bad_dispatch();
    }
    let value = eq_value(frame.arg(1), frame.arg(2));
    frame.result(Slot::Bool(value))
}

pub extern "C" fn bi_not_equals(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let expected = fbr.runtime.wk().not_equals;
    let mut frame = Frame::new(fbr, apply);
    if !frame.matches_static(expected) || frame.argc() != 2 {
        return frame.bad_dispatch();
    }
    let value = !eq_value(frame.arg(1), frame.arg(2));
    frame.result(Slot::Bool(value))
}

// ── string methods ────────────────────────────────────────────────────

fn str_args<'a>(frame: &Frame<'a>) -> Option<(&'a Str, &'a Str)> {
    let a = frame.arg(1).as_ref()?;
    let b = frame.arg(2).as_ref()?;
    if a.kind() != object::ObjectKind::Str || b.kind() != object::ObjectKind::Str {
        return None;
    }
    // SAFETY: kinds checked; strings are immutable.
    unsafe { Some((&*(a.as_ptr() as *const Str), &*(b.as_ptr() as *const Str))) }
}

pub extern "C" fn bi_add_str(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let expected = fbr.runtime.wk().add;
    let mut frame = Frame::new(fbr, apply);
    if !frame.matches_static(expected) || frame.argc() != 2 {
        return frame.bad_dispatch();
    }
    let Some((a, b)) = str_args(&frame) else {
        return frame.bad_dispatch();
    };
    let joined = format!("{}{}", a.as_str(), b.as_str());
    match new_str(frame.fbr.allocator(), &joined, false) {
        Ok(slot) => frame.result(slot),
        Err(_) => frame.raise("allocation-failed", "string too large"),
    }
}

pub extern "C" fn bi_lt_str(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let expected = fbr.runtime.wk().lessthan;
    let mut frame = Frame::new(fbr, apply);
    if !frame.matches_static(expected) || frame.argc() != 2 {
        return frame.bad_dispatch();
    }
    let Some((a, b)) = str_args(&frame) else {
        return frame.bad_dispatch();
    };
    let value = a.as_str() < b.as_str();
    frame.result(Slot::Bool(value))
}

pub extern "C" fn bi_gt_str(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let expected = fbr.runtime.wk().greaterthan;
    let mut frame = Frame::new(fbr, apply);
    if !frame.matches_static(expected) || frame.argc() != 2 {
        return frame.bad_dispatch();
    }
    let Some((a, b)) = str_args(&frame) else {
        return frame.bad_dispatch();
    };
    let value = a.as_str() > b.as_str();
    frame.result(Slot::Bool(value))
}
