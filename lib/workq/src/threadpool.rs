//! Worker binding between a work source and the threads that drive it.
//!
//! The two halves are deliberately minimal:
//!
//! * a [`TpService`] is anything with work: `do_work` runs at most one unit
//!   and reports whether it made progress, `has_work` is an advisory hint.
//! * a [`TpClient`] is anything that can wake workers: `wakeup(n)` asks for
//!   up to `n` threads and is allowed to spuriously wake or under-deliver.
//!
//! [`threadpool_attach`] binds one of each symmetrically; if either side
//! refuses, the binding is fully unwound. [`Threadpool`] is the stock
//! client: a fixed set of parked worker threads. The multiplexers let many
//! services share one client (or many clients one service), and
//! [`TpAidService`] turns wakeups into a callback for embedders without
//! dedicated workers.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::AttachError;

/// `wakeup` argument meaning "as many workers as exist".
pub const WAKE_ALL: usize = usize::MAX;

/// The work-providing half of a binding.
pub trait TpService: Send + Sync {
    /// Perform at most one unit of work. True iff progress was made. Must
    /// not block on I/O; it may only stall transitively through user
    /// callbacks.
    fn do_work(&self) -> bool;

    /// Advisory: could `do_work` currently make progress? A false positive
    /// or negative is allowed; callers must tolerate a fruitless `do_work`.
    fn has_work(&self) -> bool;

    /// The client went away; drop references to it.
    fn on_client_detach(&self) {}
}

/// The worker-providing half of a binding.
pub trait TpClient: Send + Sync {
    /// Wake up to `n` workers; returns how many were (nominally) woken.
    /// Spurious wakeups are fine.
    fn wakeup(&self, n: usize) -> usize;

    /// The service went away; drop references to it.
    fn on_service_detach(&self) {}
}

/// A component that accepts a client (e.g. a scheduler service).
pub trait TpServiceProvider {
    fn service_arg(&self) -> Arc<dyn TpService>;
    fn attach_client(&self, client: Arc<dyn TpClient>) -> Result<(), AttachError>;
    fn detach_client(&self);
}

/// A component that accepts a service (e.g. a worker pool).
pub trait TpClientProvider {
    fn client_arg(&self) -> Arc<dyn TpClient>;
    fn attach_service(&self, service: Arc<dyn TpService>) -> Result<(), AttachError>;
    fn detach_service(&self);
}

/// Bind a client and a service to each other. On failure neither side is
/// left half-attached.
pub fn threadpool_attach(
    client: &impl TpClientProvider,
    service: &impl TpServiceProvider,
) -> Result<(), AttachError> {
    let c = client.client_arg();
    let s = service.service_arg();

    service.attach_client(c)?;
    if let Err(e) = client.attach_service(s) {
        service.detach_client();
        return Err(e);
    }
    Ok(())
}

/// A pool of worker threads driving one attached service.
pub struct Threadpool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

struct PoolState {
    service: Option<Arc<dyn TpService>>,
    /// Outstanding wakeup requests; each consumed by one worker pass.
    tickets: usize,
    shutdown: bool,
}

impl Threadpool {
    pub fn default_thread_count() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                service: None,
                tickets: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let handles = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(format!("workq-worker-{i}"))
                    .spawn(move || work_loop(shared))
                    .expect("failed to spawn worker thread");
                (handle.thread().id(), handle)
            })
            .collect();

        Self {
            shared,
            threads: Mutex::new(handles),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// True when called from one of this pool's workers.
    pub fn current_thread_is_worker(&self) -> bool {
        let me = thread::current().id();
        self.threads.lock().unwrap().iter().any(|(id, _)| *id == me)
    }
}

fn work_loop(shared: Arc<PoolShared>) {
    loop {
        let service = {
            let mut st = shared.state.lock().unwrap();
            loop {
                if st.shutdown {
                    return;
                }
                if let Some(svc) = st.service.clone() {
                    if st.tickets > 0 {
                        st.tickets -= 1;
                        break svc;
                    }
                    // Advisory re-check closes the window between a missed
                    // wakeup and parking.
                    if svc.has_work() {
                        break svc;
                    }
                }
                st = shared.cond.wait(st).unwrap();
            }
        };

        while service.do_work() {}
    }
}

struct PoolClient {
    shared: Arc<PoolShared>,
    threads: usize,
}

impl TpClient for PoolClient {
    fn wakeup(&self, n: usize) -> usize {
        let granted;
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.shutdown || st.service.is_none() {
                return 0;
            }
            granted = n.min(self.threads.saturating_sub(st.tickets));
            st.tickets += granted;
        }
        if granted > 0 {
            self.shared.cond.notify_all();
        }
        granted
    }

    fn on_service_detach(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.service = None;
        st.tickets = 0;
        drop(st);
        self.shared.cond.notify_all();
    }
}

impl TpClientProvider for Threadpool {
    fn client_arg(&self) -> Arc<dyn TpClient> {
        let threads = self.thread_count();
        Arc::new(PoolClient {
            shared: Arc::clone(&self.shared),
            threads,
        })
    }

    fn attach_service(&self, service: Arc<dyn TpService>) -> Result<(), AttachError> {
        let mut st = self.shared.state.lock().unwrap();
        if st.service.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        st.service = Some(service);
        drop(st);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn detach_service(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.service = None;
        st.tickets = 0;
        drop(st);
        self.shared.cond.notify_all();
    }
}

impl Drop for Threadpool {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.shutdown = true;
        }
        self.shared.cond.notify_all();

        let me = thread::current().id();
        for (id, handle) in self.threads.lock().unwrap().drain(..) {
            if id == me {
                // A worker is tearing the pool down from inside its own
                // loop; it cannot join itself. The shutdown flag will end
                // the thread, so detaching is safe.
                drop(handle);
            } else if let Err(e) = handle.join() {
                log::error!("worker thread panicked: {e:?}");
            }
        }
    }
}

/// Callback-based client for embedders without a dedicated worker pool:
/// `wakeup` invokes the callback, which typically schedules an
/// [`TpAidService::aid`] call from wherever the embedder has spare cycles.
pub struct TpAidService {
    inner: Arc<AidInner>,
}

struct AidInner {
    #[allow(clippy::type_complexity)]
    callback: Mutex<Option<Box<dyn Fn(usize) + Send>>>,
    service: Mutex<Option<Arc<dyn TpService>>>,
}

impl TpAidService {
    pub fn new(callback: impl Fn(usize) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(AidInner {
                callback: Mutex::new(Some(Box::new(callback))),
                service: Mutex::new(None),
            }),
        }
    }

    /// Drive the attached service for up to `n` units; returns the number
    /// of units that made progress.
    pub fn aid(&self, n: usize) -> usize {
        let Some(service) = self.inner.service.lock().unwrap().clone() else {
            return 0;
        };
        let mut done = 0;
        while done < n && service.do_work() {
            done += 1;
        }
        done
    }
}

struct AidClient {
    inner: Arc<AidInner>,
}

impl TpClient for AidClient {
    fn wakeup(&self, n: usize) -> usize {
        let cb = self.inner.callback.lock().unwrap();
        match &*cb {
            Some(cb) => {
                cb(n);
                n
            }
            None => 0,
        }
    }

    fn on_service_detach(&self) {
        *self.inner.service.lock().unwrap() = None;
    }
}

impl TpClientProvider for TpAidService {
    fn client_arg(&self) -> Arc<dyn TpClient> {
        Arc::new(AidClient {
            inner: Arc::clone(&self.inner),
        })
    }

    fn attach_service(&self, service: Arc<dyn TpService>) -> Result<(), AttachError> {
        let mut s = self.inner.service.lock().unwrap();
        if s.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        *s = Some(service);
        Ok(())
    }

    fn detach_service(&self) {
        *self.inner.service.lock().unwrap() = None;
    }
}

/// Fans many services into one client: the aggregate reports work while any
/// member has some, and rotates `do_work` across members so one busy
/// service cannot starve the rest.
pub struct TpServiceMultiplexer {
    inner: Arc<SvcMuxInner>,
}

struct SvcMuxInner {
    state: Mutex<SvcMuxState>,
}

struct SvcMuxState {
    services: VecDeque<Arc<dyn TpService>>,
    client: Option<Arc<dyn TpClient>>,
}

impl TpServiceMultiplexer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SvcMuxInner {
                state: Mutex::new(SvcMuxState {
                    services: VecDeque::new(),
                    client: None,
                }),
            }),
        }
    }

    pub fn add_service(&self, service: Arc<dyn TpService>) {
        let client = {
            let mut st = self.inner.state.lock().unwrap();
            st.services.push_back(service);
            st.client.clone()
        };
        // The new member may already have pending work.
        if let Some(client) = client {
            client.wakeup(1);
        }
    }

    pub fn remove_service(&self, service: &Arc<dyn TpService>) {
        let mut st = self.inner.state.lock().unwrap();
        st.services
            .retain(|s| !Arc::ptr_eq(s, service));
        drop(st);
        service.on_client_detach();
    }
}

impl Default for TpServiceMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

struct SvcMuxService {
    inner: Arc<SvcMuxInner>,
}

impl TpService for SvcMuxService {
    fn do_work(&self) -> bool {
        // Rotate: each attempt pulls the front member, tries it, and puts
        // it at the back.
        let len = self.inner.state.lock().unwrap().services.len();
        for _ in 0..len {
            let svc = {
                let mut st = self.inner.state.lock().unwrap();
                match st.services.pop_front() {
                    Some(s) => {
                        st.services.push_back(s.clone());
                        s
                    }
                    None => return false,
                }
            };
            if svc.do_work() {
                return true;
            }
        }
        false
    }

    fn has_work(&self) -> bool {
        let services: Vec<_> = self
            .inner
            .state
            .lock()
            .unwrap()
            .services
            .iter()
            .cloned()
            .collect();
        services.iter().any(|s| s.has_work())
    }

    fn on_client_detach(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.client = None;
        let services = std::mem::take(&mut st.services);
        drop(st);
        for s in services {
            s.on_client_detach();
        }
    }
}

impl TpServiceProvider for TpServiceMultiplexer {
    fn service_arg(&self) -> Arc<dyn TpService> {
        Arc::new(SvcMuxService {
            inner: Arc::clone(&self.inner),
        })
    }

    fn attach_client(&self, client: Arc<dyn TpClient>) -> Result<(), AttachError> {
        let mut st = self.inner.state.lock().unwrap();
        if st.client.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        st.client = Some(client);
        Ok(())
    }

    fn detach_client(&self) {
        self.inner.state.lock().unwrap().client = None;
    }
}

/// Fans one service out to many clients: wakeups go to every member.
pub struct TpClientMultiplexer {
    inner: Arc<CliMuxInner>,
}

struct CliMuxInner {
    state: Mutex<CliMuxState>,
}

struct CliMuxState {
    clients: Vec<Arc<dyn TpClient>>,
    service: Option<Arc<dyn TpService>>,
}

impl TpClientMultiplexer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CliMuxInner {
                state: Mutex::new(CliMuxState {
                    clients: Vec::new(),
                    service: None,
                }),
            }),
        }
    }

    pub fn add_client(&self, client: Arc<dyn TpClient>) {
        self.inner.state.lock().unwrap().clients.push(client);
    }

    pub fn remove_client(&self, client: &Arc<dyn TpClient>) {
        let mut st = self.inner.state.lock().unwrap();
        st.clients.retain(|c| !Arc::ptr_eq(c, client));
        drop(st);
        client.on_service_detach();
    }
}

impl Default for TpClientMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

struct CliMuxClient {
    inner: Arc<CliMuxInner>,
}

impl TpClient for CliMuxClient {
    fn wakeup(&self, n: usize) -> usize {
        let clients: Vec<_> = self.inner.state.lock().unwrap().clients.clone();
        let mut woken = 0;
        for c in clients {
            woken = woken.max(c.wakeup(n));
        }
        woken.min(n)
    }

    fn on_service_detach(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.service = None;
        let clients = std::mem::take(&mut st.clients);
        drop(st);
        for c in clients {
            c.on_service_detach();
        }
    }
}

impl TpClientProvider for TpClientMultiplexer {
    fn client_arg(&self) -> Arc<dyn TpClient> {
        Arc::new(CliMuxClient {
            inner: Arc::clone(&self.inner),
        })
    }

    fn attach_service(&self, service: Arc<dyn TpService>) -> Result<(), AttachError> {
        let mut st = self.inner.state.lock().unwrap();
        if st.service.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        st.service = Some(service);
        Ok(())
    }

    fn detach_service(&self) {
        self.inner.state.lock().unwrap().service = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A service with a fixed amount of countable work.
    struct CountingService {
        remaining: AtomicUsize,
        done: AtomicUsize,
    }

    impl CountingService {
        fn new(n: usize) -> Arc<Self> {
            Arc::new(Self {
                remaining: AtomicUsize::new(n),
                done: AtomicUsize::new(0),
            })
        }
    }

    impl TpService for CountingService {
        fn do_work(&self) -> bool {
            let mut cur = self.remaining.load(Ordering::Relaxed);
            loop {
                if cur == 0 {
                    return false;
                }
                match self.remaining.compare_exchange_weak(
                    cur,
                    cur - 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.done.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(c) => cur = c,
                }
            }
        }

        fn has_work(&self) -> bool {
            self.remaining.load(Ordering::Relaxed) > 0
        }
    }

    struct CountingProvider {
        service: Arc<CountingService>,
        client: Mutex<Option<Arc<dyn TpClient>>>,
    }

    impl TpServiceProvider for CountingProvider {
        fn service_arg(&self) -> Arc<dyn TpService> {
            self.service.clone()
        }

        fn attach_client(&self, client: Arc<dyn TpClient>) -> Result<(), AttachError> {
            let mut c = self.client.lock().unwrap();
            if c.is_some() {
                return Err(AttachError::AlreadyAttached);
            }
            *c = Some(client);
            Ok(())
        }

        fn detach_client(&self) {
            *self.client.lock().unwrap() = None;
        }
    }

    #[test]
    fn pool_drains_service() {
        let pool = Threadpool::new(4);
        let provider = CountingProvider {
            service: CountingService::new(1000),
            client: Mutex::new(None),
        };
        threadpool_attach(&pool, &provider).unwrap();

        provider.client.lock().unwrap().as_ref().unwrap().wakeup(WAKE_ALL);

        while provider.service.has_work() {
            std::thread::yield_now();
        }
        assert_eq!(provider.service.done.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn double_attach_fails_and_unwinds() {
        let pool = Threadpool::new(1);
        let p1 = CountingProvider {
            service: CountingService::new(0),
            client: Mutex::new(None),
        };
        let p2 = CountingProvider {
            service: CountingService::new(0),
            client: Mutex::new(None),
        };

        threadpool_attach(&pool, &p1).unwrap();
        assert_eq!(
            threadpool_attach(&pool, &p2),
            Err(AttachError::AlreadyAttached)
        );
        // The failed binding must have been unwound on the service side.
        assert!(p2.client.lock().unwrap().is_none());
    }

    #[test]
    fn aid_service_invokes_callback() {
        let woken = Arc::new(AtomicUsize::new(0));
        let aid = {
            let woken = Arc::clone(&woken);
            TpAidService::new(move |n| {
                woken.fetch_add(n, Ordering::Relaxed);
            })
        };
        let provider = CountingProvider {
            service: CountingService::new(10),
            client: Mutex::new(None),
        };
        threadpool_attach(&aid, &provider).unwrap();

        provider.client.lock().unwrap().as_ref().unwrap().wakeup(3);
        assert_eq!(woken.load(Ordering::Relaxed), 3);

        assert_eq!(aid.aid(usize::MAX), 10);
        assert!(!provider.service.has_work());
    }

    #[test]
    fn service_multiplexer_rotates() {
        let mux = TpServiceMultiplexer::new();
        let s1 = CountingService::new(5);
        let s2 = CountingService::new(5);
        mux.add_service(s1.clone());
        mux.add_service(s2.clone());

        let agg = mux.service_arg();
        while agg.do_work() {}

        assert_eq!(s1.done.load(Ordering::Relaxed), 5);
        assert_eq!(s2.done.load(Ordering::Relaxed), 5);
        assert!(!agg.has_work());
    }

    #[test]
    fn removed_service_sees_detach() {
        let mux = TpServiceMultiplexer::new();
        let s1 = CountingService::new(1);
        let s1_dyn: Arc<dyn TpService> = s1.clone();
        mux.add_service(s1_dyn.clone());
        mux.remove_service(&s1_dyn);

        let agg = mux.service_arg();
        assert!(!agg.do_work());
    }
}
