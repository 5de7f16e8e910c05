//! Service registry and method invoker.
//!
//! A service binds an instance to a set of named methods of the fixed shape
//! `fn(&self, argument, &mut reply) -> Result<(), anyhow::Error>`. Each
//! registered method is described by a [MethodDescriptor] holding erased
//! closures that construct, decode and encode the argument and reply storage
//! in whatever codec the connection negotiated.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chashmap::CHashMap;

use crate::codec::{CodecError, CodecKind};

type BoxedValue = Box<dyn Any + Send>;

type DecodeArgumentFn = Box<dyn Fn(CodecKind, &[u8]) -> Result<BoxedValue, CodecError> + Send + Sync>;
type NewReplyFn = Box<dyn Fn() -> BoxedValue + Send + Sync>;
type HandlerFn = Box<dyn Fn(BoxedValue, &mut BoxedValue) -> Result<(), anyhow::Error> + Send + Sync>;
type EncodeReplyFn = Box<dyn Fn(CodecKind, &BoxedValue) -> Result<Vec<u8>, CodecError> + Send + Sync>;

/// Error registering a service. Registration is the only place where service
/// shape problems are surfaced; nothing fails later.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("{name:?} is not a valid service name")]
    InvalidServiceName { name: String },
    #[error("service {name:?} is already registered")]
    DuplicateService { name: String },
}

/// Error resolving a request's `"Service.Method"` target.
///
/// The display text of these errors is the wire-visible response error, so
/// the convention is fixed: `can't find service '...'`, `can't find method
/// 'Service.Method'`.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("can't find service '{service}'")]
    ServiceNotFound { service: String },
    #[error("can't find method '{service_method}'")]
    MethodNotFound { service_method: String },
}

/// Registry metadata for one invocable method.
pub struct MethodDescriptor {
    service_method: String,
    num_calls: AtomicU64,
    decode_argument: DecodeArgumentFn,
    new_reply: NewReplyFn,
    handler: HandlerFn,
    encode_reply: EncodeReplyFn,
}

impl MethodDescriptor {
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Times this method has been invoked since registration.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Constructs fresh argument storage and decodes one encoded value into
    /// it.
    pub fn decode_argument(&self, kind: CodecKind, data: &[u8]) -> Result<BoxedValue, CodecError> {
        (self.decode_argument)(kind, data)
    }

    /// Constructs fresh, writable reply storage. Container reply types start
    /// out as their empty instance, never shared between requests.
    pub fn new_reply(&self) -> BoxedValue {
        (self.new_reply)()
    }

    /// Invokes the bound method. The returned error is the method's own
    /// error; it becomes the response header's error text.
    pub fn invoke(&self, argument: BoxedValue, reply: &mut BoxedValue) -> Result<(), anyhow::Error> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(argument, reply)
    }

    pub fn encode_reply(&self, kind: CodecKind, reply: &BoxedValue) -> Result<Vec<u8>, CodecError> {
        (self.encode_reply)(kind, reply)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service_method", &self.service_method)
            .field("num_calls", &self.num_calls)
            .finish()
    }
}

/// A named service with its method table. Immutable once built, apart from
/// the per-method invocation counters.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// Starts building a service around `instance`. The exposed name must be
    /// public-scope (leading uppercase letter).
    pub fn build<S>(name: impl ToString, instance: S) -> Result<ServiceBuilder<S>, RegisterError>
    where
        S: Send + Sync + 'static,
    {
        let name = name.to_string();
        if !is_public_scope(&name) {
            return Err(RegisterError::InvalidServiceName { name });
        }
        Ok(ServiceBuilder {
            name,
            instance: Arc::new(instance),
            methods: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).map(Arc::clone)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds the method table of a [Service].
pub struct ServiceBuilder<S> {
    name: String,
    instance: Arc<S>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<S> std::fmt::Debug for ServiceBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S> ServiceBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Registers one method. Methods whose names are not public-scope are
    /// skipped with a warning, matching the registration-by-introspection
    /// behavior of skipping non-conforming methods.
    pub fn method<A, R, F>(mut self, name: impl ToString, f: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize + Default + Send + 'static,
        F: Fn(&S, A, &mut R) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        let name = name.to_string();
        if !is_public_scope(&name) {
            tracing::warn!(service = %self.name, method = %name, "skipping method with non-public name");
            return self;
        }
        let service_method = format!("{}.{}", self.name, name);
        let instance = Arc::clone(&self.instance);
        let descriptor = MethodDescriptor {
            service_method,
            num_calls: AtomicU64::new(0),
            decode_argument: Box::new(|kind, data| {
                let argument: A = kind.decode(data)?;
                Ok(Box::new(argument) as BoxedValue)
            }),
            new_reply: Box::new(|| Box::new(R::default()) as BoxedValue),
            handler: Box::new(move |argument, reply| {
                let argument = argument
                    .downcast::<A>()
                    .map_err(|_| anyhow::anyhow!("argument storage type mismatch"))?;
                let reply = reply
                    .downcast_mut::<R>()
                    .ok_or_else(|| anyhow::anyhow!("reply storage type mismatch"))?;
                f(&instance, *argument, reply)
            }),
            encode_reply: Box::new(|kind, reply| {
                let reply = reply
                    .downcast_ref::<R>()
                    .ok_or_else(|| CodecError::Encode("reply storage type mismatch".into()))?;
                kind.encode(reply)
            }),
        };
        self.methods.insert(name, Arc::new(descriptor));
        self
    }

    pub fn finish(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// All services reachable over a server. Populated at startup; concurrent
/// lookups afterwards.
#[derive(Default)]
pub struct ServiceRegistry {
    services: CHashMap<String, Service>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Service) -> Result<(), RegisterError> {
        let name = service.name().to_string();
        if self.services.contains_key(&name) {
            return Err(RegisterError::DuplicateService { name });
        }
        self.services.insert(name, service);
        Ok(())
    }

    /// Resolves a service and method name to its descriptor.
    pub fn lookup(&self, service: &str, method: &str) -> Result<Arc<MethodDescriptor>, LookupError> {
        let registered = self
            .services
            .get(service)
            .ok_or_else(|| LookupError::ServiceNotFound {
                service: service.to_string(),
            })?;
        registered.method(method).ok_or_else(|| LookupError::MethodNotFound {
            service_method: format!("{}.{}", service, method),
        })
    }
}

fn is_public_scope(name: &str) -> bool {
    name.chars().next().map_or(false, char::is_uppercase)
}
