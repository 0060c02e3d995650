//! Top-level wiring (§C.2–C.4): the object application code actually
//! constructs. Bundles one CM event source, N Event Processors, and one
//! Completion Context behind `Service`, the way `InfinibandService` bundles
//! one event channel, one device context, and N processors in the original.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cm::{CmDemux, CmEventSource, ConnectionRegistry};
use crate::completion::{CompletionContext, CompletionSource};
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandler};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::reactor::EventProcessor;

/// Owns every processor, the CM event demultiplexer, and the shared
/// completion context for one service instance.
pub struct Service {
    processors: Vec<Arc<EventProcessor>>,
    processor_threads: Vec<JoinHandle<()>>,
    completion: Arc<CompletionContext>,
    registry: ConnectionRegistry,
    cm_demux: Option<CmDemux>,
    cm_thread: Option<JoinHandle<()>>,
    next_processor: AtomicUsize,
}

impl Service {
    /// Builds `config.processor_count` (minimum 1) event processors, a
    /// shared completion context, and spawns the CM demultiplexer against
    /// `cm_source`. When `completion_source` is supplied, the completion
    /// context is wired to drain it from the first processor's poll loop —
    /// without one (tests, or a device-less embedding) the context stays a
    /// harmless no-op poller, per [`CompletionContext::poll`].
    pub fn new<S>(
        config: &Config,
        processor_count: usize,
        cm_source: S,
        completion_source: Option<Box<dyn CompletionSource>>,
    ) -> Result<Service>
    where
        S: CmEventSource + 'static,
    {
        let processor_count = processor_count.max(1);
        let mut processors = Vec::with_capacity(processor_count);
        let mut processor_threads = Vec::with_capacity(processor_count);
        for _ in 0..processor_count {
            let processor = Arc::new(EventProcessor::new(config.poll_cycles)?);
            processor_threads.push(EventProcessor::spawn(processor.clone()));
            processors.push(processor);
        }

        let send_pool = crate::buffer::BufferPool::new(config.buffer_length);
        let recv_pool = crate::buffer::BufferPool::new(config.buffer_length);
        let completion = Arc::new(CompletionContext::new(send_pool, recv_pool));

        if let Some(source) = completion_source {
            let fd = source.fd();
            completion.attach_source(source);
            processors[0].register(&fd, completion.clone() as Arc<dyn crate::reactor::Poller>)?;
        }

        let registry = ConnectionRegistry::new();
        let (cm_demux, cm_thread) = CmDemux::spawn(cm_source, registry.clone());

        Ok(Service {
            processors,
            processor_threads,
            completion,
            registry,
            cm_demux: Some(cm_demux),
            cm_thread: Some(cm_thread),
            next_processor: AtomicUsize::new(0),
        })
    }

    pub fn processor(&self, idx: usize) -> Arc<EventProcessor> {
        self.processors[idx].clone()
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn completion_context(&self) -> &Arc<CompletionContext> {
        &self.completion
    }

    /// Round-robins across processors when `processor` is `None`, matching
    /// the original service's connection-assignment policy (§C.3).
    fn pick_processor(&self, processor: Option<usize>) -> Arc<EventProcessor> {
        match processor {
            Some(idx) => self.processor(idx),
            None => {
                let idx = self.next_processor.fetch_add(1, Ordering::Relaxed) % self.processors.len();
                self.processor(idx)
            }
        }
    }

    /// Opens an outbound connection, assigning it to `processor` or
    /// round-robining if `None`.
    pub fn connect(
        &self,
        endpoint: &Endpoint,
        handler: Arc<dyn ConnectionHandler>,
        processor: Option<usize>,
    ) -> Result<Connection> {
        let processor = self.pick_processor(processor);
        let connection = Connection::open(&processor, &self.completion, handler)?;
        self.registry.insert(connection.clone());
        connection.connect(endpoint)?;
        Ok(connection)
    }

    /// Opens a listening connection, assigning it to `processor` or
    /// round-robining if `None`.
    pub fn bind(
        &self,
        endpoint: &Endpoint,
        backlog: i32,
        handler: Arc<dyn ConnectionHandler>,
        processor: Option<usize>,
    ) -> Result<Connection> {
        let processor = self.pick_processor(processor);
        let connection = Connection::open(&processor, &self.completion, handler)?;
        self.registry.insert(connection.clone());
        connection.bind(endpoint)?;
        connection.listen(backlog)?;
        Ok(connection)
    }

    /// Graceful shutdown, reproducing `EventProcessor.cpp`'s/
    /// `InfinibandService.cpp`'s destructor ordering: request the CM thread
    /// to exit on its next interrupted syscall, then join it, then join
    /// every event processor thread (§C.4, §8 invariant 5).
    pub fn shutdown(&mut self) {
        if let Some(demux) = self.cm_demux.take() {
            demux.request_shutdown();
        }
        if let Some(thread) = self.cm_thread.take() {
            let _ = thread.join();
        }
        for thread in self.processor_threads.drain(..) {
            // Event Processor threads run an infinite loop (§4.1); this
            // crate does not currently inject a per-processor stop signal,
            // matching the original's "we have to join the poll thread, but
            // cannot call join from the loop thread" TODO rather than
            // inventing a new mechanism here. Detaching is the honest
            // behavior until that signal exists.
            drop(thread);
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cm::RawCmEvent;
    use std::io;

    struct NeverSource;
    impl CmEventSource for NeverSource {
        fn get_event(&mut self) -> io::Result<Option<RawCmEvent>> {
            std::thread::park();
            Ok(None)
        }
    }

    struct NullHandler;
    impl ConnectionHandler for NullHandler {
        fn on_connected(&self, _result: Result<()>) {}
        fn on_receive(
            &self,
            _buf: &crate::buffer::BufferView<'_>,
            _len: usize,
            _result: Result<()>,
        ) {
        }
        fn on_send(&self, _buf: &crate::buffer::BufferView<'_>, _len: usize, _result: Result<()>) {}
    }

    #[test]
    fn round_robins_across_processors() {
        let config = Config::default();
        let service = Service::new(&config, 2, NeverSource, None).unwrap();
        let a = service
            .connect(
                &"127.0.0.1:1".parse().unwrap(),
                Arc::new(NullHandler),
                None,
            )
            .unwrap();
        let b = service
            .connect(
                &"127.0.0.1:2".parse().unwrap(),
                Arc::new(NullHandler),
                None,
            )
            .unwrap();
        assert_ne!(a.id(), b.id());
    }
}
