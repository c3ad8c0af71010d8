//! Background writer: one thread per log file
//!
//! Drains the file's queue in FIFO order. When the queue runs dry it first
//! writes out buffered bytes, then sleeps until woken by a new item or a
//! rotation request. Every work item runs under panic isolation so a
//! misbehaving hook is reported and the writer carries on.

use super::shared_file::{Queued, SharedFileState};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

enum Work {
    Rotate,
    Item(Queued),
    /// Queue is empty and bytes may be buffered
    Idle,
}

pub(crate) fn run(state: Arc<SharedFileState>) {
    let mut dirty = false;
    loop {
        let work = next_work(&state, &mut dirty);
        let mut finished = false;

        let outcome = isolate(|| match work {
            Work::Rotate => {
                let mut sink = state.sink.lock();
                match sink.rotate() {
                    Ok(report) => {
                        for skipped in report.skipped {
                            state.report(&skipped.to_string());
                        }
                    }
                    Err(e) => state.report(&e.to_string()),
                }
            }
            Work::Idle => {
                if let Err(e) = state.sink.lock().flush() {
                    state.report(&e.to_string());
                }
            }
            Work::Item(Queued::Entry { origin, entry, ship }) => {
                let mut sink = state.sink.lock();
                origin.process(Some(&mut *sink), entry, ship);
                dirty = true;
            }
            Work::Item(Queued::FlushCoalesced { origin, generation }) => {
                let mut sink = state.sink.lock();
                origin.flush_coalesced(Some(&mut *sink), generation);
                dirty = true;
            }
            Work::Item(Queued::Flush { done }) => {
                if let Err(e) = state.sink.lock().flush() {
                    state.report(&e.to_string());
                }
                dirty = false;
                let _ = done.send(());
            }
            Work::Item(Queued::Detach { origin, done }) => {
                let (closed, timer) = {
                    let mut sink = state.sink.lock();
                    let timer = origin.drain_coalescer(Some(&mut *sink));
                    if let Err(e) = sink.flush() {
                        state.report(&e.to_string());
                    }
                    (state.detach_locked(&mut sink), timer)
                };
                // Timers of background loggers only touch the queue
                if let Some(timer) = timer {
                    timer.cancel_and_join();
                }
                dirty = false;
                finished = closed;
                let _ = done.send(());
            }
        });

        if let Err(message) = outcome {
            state.report(&format!("writer for '{}' recovered from panic: {}", state.path().display(), message));
        }
        if finished {
            break;
        }
    }
}

fn next_work(state: &SharedFileState, dirty: &mut bool) -> Work {
    let mut queue = state.queue.lock();
    loop {
        if state.rotate_requested.swap(false, Ordering::SeqCst) {
            return Work::Rotate;
        }
        if let Some(item) = queue.items.pop_front() {
            return Work::Item(item);
        }
        if *dirty {
            *dirty = false;
            return Work::Idle;
        }
        state.wake.wait(&mut queue);
    }
}

/// Run `f`, turning a panic into its message
pub(crate) fn isolate<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_passes_value_through() {
        assert_eq!(isolate(|| 7), Ok(7));
    }

    #[test]
    fn test_isolate_captures_panic_message() {
        let result: Result<(), String> = isolate(|| panic!("formatter exploded"));
        assert_eq!(result, Err("formatter exploded".to_string()));

        let code = 3;
        let result: Result<(), String> = isolate(|| panic!("hook failed with {}", code));
        assert_eq!(result, Err("hook failed with 3".to_string()));
    }
}
