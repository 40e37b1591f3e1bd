//! Converter chains: lazy transformations between two shared states.
//!
//! A converter holds its target weakly and its source strongly, which is
//! what breaks the cycle between a future's converter and the source's
//! dependant list: when the target dies the conversion quietly evaporates,
//! while the source stays alive as long as anyone still wants its result.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use crate::launch::capture;
use crate::state::{ConverterStart, SharedState};
use crate::{Failure, Future, SharedFuture};

/// How a converter pulls the source's outcome.
type Extract<T> = fn(&Arc<SharedState<T>>) -> Result<T, Failure>;

struct Converter<T: Send + 'static, U: Send + 'static, F> {
    target: Weak<SharedState<U>>,
    src: Mutex<Option<Arc<SharedState<T>>>>,
    f: Mutex<Option<F>>,
    extract: Extract<T>,
}

impl<T: Send + 'static, U: Send + 'static, F> ConverterStart for Converter<T, U, F>
where
    F: Send + 'static,
{
    fn start_deferred(&self, async_: bool) {
        let src = self.src.lock().unwrap().clone();
        if let Some(src) = src {
            src.start_deferred(async_);
        }
    }
}

/// Dependant callback on the source: transform and install into the
/// target.
fn converter_ready<T, U, F>(weak: Weak<dyn Any + Send + Sync>)
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    let Some(any) = weak.upgrade() else {
        return;
    };
    let Ok(conv) = any.downcast::<Converter<T, U, F>>() else {
        return;
    };

    let src = conv.src.lock().unwrap().take();
    let f = conv.f.lock().unwrap().take();
    let (Some(src), Some(f)) = (src, f) else {
        return;
    };

    let outcome = match (conv.extract)(&src) {
        Ok(v) => capture(move || f(v)),
        Err(e) => Err(e),
    };
    drop(src);

    if let Some(target) = conv.target.upgrade() {
        target.clear_convert();
        let _ = target.fulfill(outcome);
    }
}

fn build_converter<T, U, F>(
    src: Arc<SharedState<T>>,
    extract: Extract<T>,
    f: F,
) -> Future<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    let target = SharedState::<U>::new(false);

    let conv = Arc::new(Converter::<T, U, F> {
        target: Arc::downgrade(&target),
        src: Mutex::new(Some(src.clone())),
        f: Mutex::new(Some(f)),
        extract,
    });

    // Reserve the dependant slot before publishing the converter, so a
    // concurrent ready transition cannot slip between the two.
    let tx = src.register_dependant_begin();
    target.mark_convert_present();
    target.set_converter(conv.clone());

    let weak: Weak<dyn Any + Send + Sync> = {
        let any: Arc<dyn Any + Send + Sync> = conv;
        Arc::downgrade(&any)
    };
    src.register_dependant_commit(tx, converter_ready::<T, U, F>, weak);

    // If the target was started before the converter existed, forward now.
    let (called, async_) = target.get_start_deferred();
    if called {
        src.start_deferred(async_);
    }

    Future::from_state(target)
}

/// A future holding `f` applied to `src`'s value. Failures pass through
/// untransformed; a panic in `f` becomes the target's failure.
pub fn convert<T, U, F>(src: Future<T>, f: F) -> Future<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    build_converter(src.into_state(), |s| s.take_value(), f)
}

/// As [`convert`], from a shared future (the value is taken by clone).
pub fn convert_shared<T, U, F>(src: &SharedFuture<T>, f: F) -> Future<U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    build_converter(src.state().clone(), |s| s.clone_value(), f)
}

/// Whether attaching a callback also starts the source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PromiseStart {
    Start,
    Defer,
}

/// Attach `f` to run (with the future) once `fut` becomes ready. The
/// source is started: attaching a callback expresses interest in the
/// result.
pub fn callback<T, F>(fut: Future<T>, f: F)
where
    T: Send + 'static,
    F: FnOnce(Future<T>) + Send + 'static,
{
    let state = fut.into_state();
    state.install_callback(Box::new(f));
    state.start_deferred(false);
}

/// Shared-future callback; each attached callback receives its own copy.
pub fn callback_shared<T, F>(fut: &SharedFuture<T>, f: F, start: PromiseStart)
where
    T: Send + 'static,
    F: FnOnce(SharedFuture<T>) + Send + 'static,
{
    let state = fut.state().clone();
    state.install_shared_callback(Box::new(f));
    if start == PromiseStart::Start {
        state.start_deferred(false);
    }
}
