//! Handler container and per-message scopes.
//!
//! Handlers are registered against a message type up front. Each inbound
//! message gets a fresh [`Scope`]: handler factories run inside it, scoped
//! services are created at most once per scope, and disposal callbacks run
//! when the scope is dropped.
//!
//! ```ignore
//! let mut container = Container::new();
//! container
//!     .register_scoped(|_| UnitOfWork::begin())
//!     .register_request_handler::<Ping, _>(|scope| PingHandler::new(scope.get::<UnitOfWork>()));
//! let container = Arc::new(container);
//! ```

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::message::{ApplicationEvent, Command, Request};
use crate::ports::inbound::{CommandHandler, EventSubscriber, RequestHandler};
use crate::registry::DispatchTable;

/// Which protocol a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Request,
    Command,
    Event,
}

/// Handlers are looked up by protocol and message type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub kind: HandlerKind,
    pub type_tag: String,
}

impl HandlerKey {
    pub fn new(kind: HandlerKind, type_tag: impl Into<String>) -> Self {
        Self {
            kind,
            type_tag: type_tag.into(),
        }
    }

    pub fn request(type_tag: impl Into<String>) -> Self {
        Self::new(HandlerKind::Request, type_tag)
    }

    pub fn command(type_tag: impl Into<String>) -> Self {
        Self::new(HandlerKind::Command, type_tag)
    }

    pub fn event(type_tag: impl Into<String>) -> Self {
        Self::new(HandlerKind::Event, type_tag)
    }
}

type HandlerFactory = Arc<dyn Fn(&Scope) -> Box<dyn Any + Send + Sync> + Send + Sync>;
type ServiceFactory = Arc<dyn Fn(&Scope) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

struct Registration {
    name: String,
    factory: HandlerFactory,
}

/// A handler produced inside a scope, with the name it was registered under.
pub struct Resolved<T> {
    pub name: String,
    pub handler: T,
}

/// Registrations for handlers and scoped services.
#[derive(Default)]
pub struct Container {
    handlers: HashMap<HandlerKey, Vec<Registration>>,
    services: HashMap<TypeId, ServiceFactory>,
    dispatch: DispatchTable,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for request type `R`.
    pub fn register_request_handler<R, H>(
        &mut self,
        factory: impl Fn(&Scope) -> H + Send + Sync + 'static,
    ) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R> + 'static,
    {
        let factory: HandlerFactory = Arc::new(move |scope: &Scope| {
            let handler: Arc<dyn RequestHandler<R>> = Arc::new(factory(scope));
            Box::new(handler) as Box<dyn Any + Send + Sync>
        });
        self.add(HandlerKey::request(R::TYPE_TAG), short_type_name::<H>(), factory);
        self.register_request_type::<R>()
    }

    /// Register a handler for command type `C`.
    pub fn register_command_handler<C, H>(
        &mut self,
        factory: impl Fn(&Scope) -> H + Send + Sync + 'static,
    ) -> &mut Self
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let factory: HandlerFactory = Arc::new(move |scope: &Scope| {
            let handler: Arc<dyn CommandHandler<C>> = Arc::new(factory(scope));
            Box::new(handler) as Box<dyn Any + Send + Sync>
        });
        self.add(HandlerKey::command(C::TYPE_TAG), short_type_name::<H>(), factory);
        self.register_command_type::<C>()
    }

    /// Register one more subscriber for event type `E`.
    pub fn register_event_subscriber<E, H>(
        &mut self,
        factory: impl Fn(&Scope) -> H + Send + Sync + 'static,
    ) -> &mut Self
    where
        E: ApplicationEvent,
        H: EventSubscriber<E> + 'static,
    {
        let factory: HandlerFactory = Arc::new(move |scope: &Scope| {
            let handler: Arc<dyn EventSubscriber<E>> = Arc::new(factory(scope));
            Box::new(handler) as Box<dyn Any + Send + Sync>
        });
        self.add(HandlerKey::event(E::TYPE_TAG), short_type_name::<H>(), factory);
        self.register_event_type::<E>()
    }

    /// Make request type `R` decodable without registering a handler.
    pub fn register_request_type<R: Request>(&mut self) -> &mut Self {
        self.dispatch.add_request::<R>();
        self
    }

    pub fn register_command_type<C: Command>(&mut self) -> &mut Self {
        self.dispatch.add_command::<C>();
        self
    }

    pub fn register_event_type<E: ApplicationEvent>(&mut self) -> &mut Self {
        self.dispatch.add_event::<E>();
        self
    }

    /// Register a service created at most once per scope.
    pub fn register_scoped<T: Send + Sync + 'static>(
        &mut self,
        factory: impl Fn(&Scope) -> T + Send + Sync + 'static,
    ) -> &mut Self {
        let factory: ServiceFactory = Arc::new(move |scope: &Scope| {
            Arc::new(factory(scope)) as Arc<dyn Any + Send + Sync>
        });
        self.services.insert(TypeId::of::<T>(), factory);
        self
    }

    /// Open a fresh scope.
    pub fn new_scope(self: &Arc<Self>) -> Scope {
        Scope {
            container: self.clone(),
            services: Mutex::new(HashMap::new()),
            disposers: Mutex::new(Vec::new()),
        }
    }

    /// Number of handlers registered under a key.
    pub fn handler_count(&self, key: &HandlerKey) -> usize {
        self.handlers.get(key).map_or(0, Vec::len)
    }

    pub(crate) fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    fn add(&mut self, key: HandlerKey, name: String, factory: HandlerFactory) {
        self.handlers
            .entry(key)
            .or_default()
            .push(Registration { name, factory });
    }
}

/// Lifetime of one inbound message.
pub struct Scope {
    container: Arc<Container>,
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    disposers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Scope {
    /// Create every handler registered under `key`, downcast to `T`.
    pub fn resolve_all<T: 'static>(&self, key: &HandlerKey) -> Vec<Resolved<T>> {
        let Some(registrations) = self.container.handlers.get(key) else {
            return Vec::new();
        };
        registrations
            .iter()
            .filter_map(|registration| {
                let handler = (registration.factory)(self).downcast::<T>().ok()?;
                Some(Resolved {
                    name: registration.name.clone(),
                    handler: *handler,
                })
            })
            .collect()
    }

    /// Scoped service of type `T`, created on first use.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.services.lock().get(&type_id) {
            return existing.clone().downcast::<T>().ok();
        }

        // Built outside the lock: the factory may resolve other services.
        let factory = self.container.services.get(&type_id)?.clone();
        let created = factory(self);
        let service = self
            .services
            .lock()
            .entry(type_id)
            .or_insert(created)
            .clone();
        service.downcast::<T>().ok()
    }

    /// Run `f` when this scope is dropped. Callbacks run in reverse order.
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        self.disposers.lock().push(Box::new(f));
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let disposers = std::mem::take(&mut *self.disposers.lock());
        for dispose in disposers.into_iter().rev() {
            dispose();
        }
        self.services.lock().clear();
    }
}

/// `my_crate::handlers::PingHandler<X>` -> `PingHandler`
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
