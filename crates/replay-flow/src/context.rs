// Ref-counted per-connection contexts.
//
// Every chunk being worked on retains the context of its connection and
// releases it when the chunk settles. The context (and the lifecycle object it
// owns, a tracing span by default) is created on the first retain and ended on
// the release that brings the count back to zero. Ending happens outside the
// map lock but only on the path that removed the entry, so it runs once.
use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{FlowError, Result};
use crate::key::ConnectionKey;

/// Per-connection resource whose lifetime is tied to the context refcount.
pub trait ConnectionLifecycle: Send + Sync + 'static {
    fn end(&self);

    /// Span that work for the connection runs under.
    fn span(&self) -> tracing::Span {
        tracing::Span::none()
    }
}

/// Default lifecycle object: a `channel` span covering every chunk of the
/// connection that was in flight while the context was alive.
#[derive(Debug)]
pub struct ChannelSpan {
    span: Mutex<Option<tracing::Span>>,
}

impl ChannelSpan {
    pub fn new(key: &ConnectionKey) -> Self {
        let span = tracing::info_span!(
            "channel",
            connection_id = %key.connection_id(),
            first_stream_index = key.stream_index()
        );
        Self {
            span: Mutex::new(Some(span)),
        }
    }

    /// The live span, or `Span::none()` once the context has ended.
    pub fn span(&self) -> tracing::Span {
        self.span.lock().clone().unwrap_or_else(tracing::Span::none)
    }

    pub fn is_ended(&self) -> bool {
        self.span.lock().is_none()
    }
}

impl ConnectionLifecycle for ChannelSpan {
    fn end(&self) {
        if let Some(span) = self.span.lock().take() {
            span.in_scope(|| tracing::debug!("channel context ended"));
        }
    }

    fn span(&self) -> tracing::Span {
        ChannelSpan::span(self)
    }
}

#[derive(Debug)]
pub struct ConnectionContext<L = ChannelSpan> {
    connection_id: String,
    lifecycle: L,
}

impl<L> ConnectionContext<L> {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }
}

struct RefCountedContext<L> {
    context: Arc<ConnectionContext<L>>,
    ref_count: usize,
}

type LifecycleFactory<L> = Box<dyn Fn(&ConnectionKey) -> L + Send + Sync>;

pub struct ConnectionContextRegistry<L = ChannelSpan> {
    contexts: Mutex<HashMap<String, RefCountedContext<L>, RandomState>>,
    create: LifecycleFactory<L>,
}

impl ConnectionContextRegistry<ChannelSpan> {
    pub fn new() -> Self {
        Self::with_factory(ChannelSpan::new)
    }
}

impl Default for ConnectionContextRegistry<ChannelSpan> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ConnectionLifecycle> ConnectionContextRegistry<L> {
    pub fn with_factory(create: impl Fn(&ConnectionKey) -> L + Send + Sync + 'static) -> Self {
        Self {
            contexts: Mutex::new(HashMap::with_hasher(RandomState::new())),
            create: Box::new(create),
        }
    }

    pub fn retain_or_create_context(&self, key: &ConnectionKey) -> Arc<ConnectionContext<L>> {
        let mut contexts = self.contexts.lock();
        let entry = contexts
            .entry(key.connection_id().to_string())
            .or_insert_with(|| {
                tracing::debug!(connection_id = %key.connection_id(), "creating channel context");
                metrics::gauge!("replay_active_channels").increment(1.0);
                RefCountedContext {
                    context: Arc::new(ConnectionContext {
                        connection_id: key.connection_id().to_string(),
                        lifecycle: (self.create)(key),
                    }),
                    ref_count: 0,
                }
            });
        entry.ref_count += 1;
        Arc::clone(&entry.context)
    }

    /// Drop one reference; the final release ends the lifecycle object.
    ///
    /// `context` must be the instance this registry currently holds for its
    /// connection. A stale context from an earlier lifetime of the same
    /// connection id is rejected.
    pub fn release_context_for(
        &self,
        context: &Arc<ConnectionContext<L>>,
    ) -> Result<Arc<ConnectionContext<L>>> {
        let connection_id = context.connection_id();
        let final_release = {
            let mut contexts = self.contexts.lock();
            let Some(entry) = contexts.get_mut(connection_id) else {
                tracing::error!(connection_id, "release for a connection with no context");
                return Err(FlowError::UnknownContext(connection_id.to_string()));
            };
            if !Arc::ptr_eq(&entry.context, context) {
                tracing::error!(connection_id, "release with a context this registry did not issue");
                return Err(FlowError::ContextMismatch(connection_id.to_string()));
            }
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                contexts.remove(connection_id);
                true
            } else {
                false
            }
        };
        if final_release {
            context.lifecycle.end();
            metrics::gauge!("replay_active_channels").decrement(1.0);
        }
        Ok(Arc::clone(context))
    }

    pub fn ref_count(&self, connection_id: &str) -> Option<usize> {
        self.contexts
            .lock()
            .get(connection_id)
            .map(|entry| entry.ref_count)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}
