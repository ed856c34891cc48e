//! Binding handler parameters to the pieces of a delivery.
//!
//! A handler declares its parameters, in order, with a [`HandlerSignature`]:
//!
//! - `body` receives the deserialized message;
//! - `header` receives a string header, required (`String`) or optional (`Option<String>`);
//! - `service` / `keyed_service` receive a service resolved for the delivery;
//! - `dynamic` receives whatever a function of the [`DispatchContext`] returns.
//!
//! The signature is checked once, when the handler is registered, by [`BinderSet::build`].
//! The resulting [`BinderSet`] is then evaluated for every delivery.
use super::context::DispatchContext;
use crate::amqp::convenience::BasicPropertiesExt;
use crate::serialization::DefaultSerializer;
use crate::services::{ServiceInstance, ServiceKey};
use std::any::{type_name, Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// The declared type of a parameter.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

impl TypeDescriptor {
    pub fn of<T: Any + ?Sized>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn is<T: Any + ?Sized>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

type DynamicBinder<M, S> = Arc<
    dyn for<'a> Fn(&DispatchContext<'a, M, S>) -> Result<ServiceInstance, anyhow::Error>
        + Send
        + Sync,
>;

fn dynamic_binder<M, S, F>(binder: F) -> DynamicBinder<M, S>
where
    F: for<'a> Fn(&DispatchContext<'a, M, S>) -> Result<ServiceInstance, anyhow::Error>
        + Send
        + Sync
        + 'static,
{
    Arc::new(binder)
}

enum Source<M, S> {
    Body,
    Header(String),
    Service(ServiceKey),
    Dynamic(DynamicBinder<M, S>),
}

struct Parameter<M, S> {
    name: String,
    declared: TypeDescriptor,
    source: Source<M, S>,
}

/// The ordered parameter list of a handler.
///
/// ```rust
/// use carrot_dispatch::consumers::HandlerSignature;
///
/// struct Ledger;
/// struct Payment;
///
/// let signature = HandlerSignature::<Payment>::new()
///     .body::<Payment>("payment")
///     .header::<Option<String>>("tenant", "TenantId")
///     .service::<Ledger>("ledger");
/// ```
pub struct HandlerSignature<M, S = DefaultSerializer> {
    parameters: Vec<Parameter<M, S>>,
}

impl<M, S> Default for HandlerSignature<M, S> {
    fn default() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }
}

impl<M, S> HandlerSignature<M, S>
where
    M: Send + Sync + 'static,
    S: 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The deserialized message. `T` must be the message type of the handler.
    #[must_use]
    pub fn body<T: Any>(self, name: impl Into<String>) -> Self {
        self.push::<T>(name, Source::Body)
    }

    /// A string header, looked up by name.
    ///
    /// `T` must be `String` (the header is required) or `Option<String>`.
    #[must_use]
    pub fn header<T: Any>(self, name: impl Into<String>, header: impl Into<String>) -> Self {
        self.push::<T>(name, Source::Header(header.into()))
    }

    #[must_use]
    pub fn service<T: Any + Send + Sync>(self, name: impl Into<String>) -> Self {
        self.push::<T>(name, Source::Service(ServiceKey::of::<T>()))
    }

    #[must_use]
    pub fn keyed_service<T: Any + Send + Sync>(
        self,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.push::<T>(name, Source::Service(ServiceKey::keyed::<T>(key)))
    }

    /// A value computed from the dispatch context, e.g. the delivery tag or the
    /// cancellation token.
    #[must_use]
    pub fn dynamic<T, F>(self, name: impl Into<String>, binder: F) -> Self
    where
        T: Any + Send + Sync,
        F: for<'a> Fn(&DispatchContext<'a, M, S>) -> Result<T, anyhow::Error>
            + Send
            + Sync
            + 'static,
    {
        let binder = dynamic_binder(move |context| {
            binder(context).map(|value| Arc::new(value) as ServiceInstance)
        });
        self.push::<T>(name, Source::Dynamic(binder))
    }

    fn push<T: Any>(mut self, name: impl Into<String>, source: Source<M, S>) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            declared: TypeDescriptor::of::<T>(),
            source,
        });
        self
    }
}

/// The signature of a handler is inconsistent.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BinderConfigurationError {
    #[error("Parameter `{parameter}` is bound to header `{header}` but is declared as `{declared}`: headers bind to `String` or `Option<String>`.")]
    HeaderNotString {
        parameter: String,
        header: String,
        declared: &'static str,
    },
    #[error("Parameter `{parameter}` is bound to the message body but is declared as `{declared}` instead of `{expected}`.")]
    BodyTypeMismatch {
        parameter: String,
        declared: &'static str,
        expected: &'static str,
    },
    #[error("Parameter `{parameter}` is declared more than once.")]
    DuplicateParameter { parameter: String },
}

/// Binding failed for a specific delivery.
#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("Required header `{header}` (parameter `{parameter}`) is missing or is not a string.")]
    MissingHeader { parameter: String, header: String },
    #[error("No service `{service}` could be resolved for parameter `{parameter}`.")]
    UnresolvedService { parameter: String, service: String },
    #[error("Failed to compute the value of parameter `{parameter}`.")]
    Dynamic {
        parameter: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Argument {index} is not a {expected}.")]
    Mismatch {
        index: usize,
        expected: &'static str,
    },
}

enum Binder<M, S> {
    Body,
    Header { header: String, required: bool },
    Service(ServiceKey),
    Dynamic(DynamicBinder<M, S>),
}

/// A validated [`HandlerSignature`], ready to produce the arguments of each delivery.
pub struct BinderSet<M, S = DefaultSerializer> {
    binders: Arc<[(String, Binder<M, S>)]>,
}

impl<M, S> Clone for BinderSet<M, S> {
    fn clone(&self) -> Self {
        Self {
            binders: Arc::clone(&self.binders),
        }
    }
}

impl<M, S> BinderSet<M, S>
where
    M: Send + Sync + 'static,
    S: 'static,
{
    pub fn build(signature: &HandlerSignature<M, S>) -> Result<Self, BinderConfigurationError> {
        let mut names = HashSet::new();
        let mut binders = Vec::with_capacity(signature.parameters.len());

        for parameter in &signature.parameters {
            if !names.insert(parameter.name.as_str()) {
                return Err(BinderConfigurationError::DuplicateParameter {
                    parameter: parameter.name.clone(),
                });
            }

            let binder = match &parameter.source {
                Source::Body if parameter.declared.is::<M>() => Binder::Body,
                Source::Body => {
                    return Err(BinderConfigurationError::BodyTypeMismatch {
                        parameter: parameter.name.clone(),
                        declared: parameter.declared.name(),
                        expected: type_name::<M>(),
                    })
                }
                Source::Header(header) if parameter.declared.is::<String>() => Binder::Header {
                    header: header.clone(),
                    required: true,
                },
                Source::Header(header) if parameter.declared.is::<Option<String>>() => {
                    Binder::Header {
                        header: header.clone(),
                        required: false,
                    }
                }
                Source::Header(header) => {
                    return Err(BinderConfigurationError::HeaderNotString {
                        parameter: parameter.name.clone(),
                        header: header.clone(),
                        declared: parameter.declared.name(),
                    })
                }
                Source::Service(key) => Binder::Service(key.clone()),
                Source::Dynamic(binder) => Binder::Dynamic(Arc::clone(binder)),
            };
            binders.push((parameter.name.clone(), binder));
        }

        Ok(Self {
            binders: binders.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.binders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binders.is_empty()
    }

    /// Produce the arguments for a delivery, in parameter order.
    pub fn evaluate(&self, context: &DispatchContext<'_, M, S>) -> Result<Arguments<M>, BindError> {
        let values = self
            .binders
            .iter()
            .map(|(name, binder)| {
                let argument = match binder {
                    Binder::Body => Argument::Body(Arc::clone(&context.message)),
                    Binder::Header { header, required } => {
                        let value = context
                            .delivery
                            .properties
                            .get_header_str(header.as_str())
                            .map(|value| value.into_owned());
                        if value.is_none() && *required {
                            return Err(BindError::MissingHeader {
                                parameter: name.clone(),
                                header: header.clone(),
                            });
                        }
                        Argument::Header(value)
                    }
                    Binder::Service(key) => context
                        .services
                        .resolve(key)
                        .map(Argument::Service)
                        .ok_or_else(|| BindError::UnresolvedService {
                            parameter: name.clone(),
                            service: key.to_string(),
                        })?,
                    Binder::Dynamic(binder) => {
                        binder(context)
                            .map(Argument::Value)
                            .map_err(|source| BindError::Dynamic {
                                parameter: name.clone(),
                                source,
                            })?
                    }
                };
                Ok((name.clone(), argument))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Arguments { values })
    }
}

/// A bound argument.
pub enum Argument<M> {
    Body(Arc<M>),
    Header(Option<String>),
    Service(ServiceInstance),
    Value(ServiceInstance),
}

impl<M> fmt::Debug for Argument<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(_) => f.write_str("Body"),
            Self::Header(value) => f.debug_tuple("Header").field(value).finish(),
            Self::Service(_) => f.write_str("Service"),
            Self::Value(_) => f.write_str("Value"),
        }
    }
}

/// The arguments of a handler invocation, in the order of its [`HandlerSignature`].
#[derive(Debug)]
pub struct Arguments<M> {
    values: Vec<(String, Argument<M>)>,
}

impl<M: Send + Sync + 'static> Arguments<M> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The position of a parameter, by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.values.iter().position(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Argument<M>)> {
        self.values
            .iter()
            .map(|(name, argument)| (name.as_str(), argument))
    }

    pub fn body(&self, index: usize) -> Result<Arc<M>, BindError> {
        match self.get(index) {
            Some(Argument::Body(message)) => Ok(Arc::clone(message)),
            _ => Err(BindError::Mismatch {
                index,
                expected: "message body",
            }),
        }
    }

    /// An optional header.
    pub fn header(&self, index: usize) -> Result<Option<&str>, BindError> {
        match self.get(index) {
            Some(Argument::Header(value)) => Ok(value.as_deref()),
            _ => Err(BindError::Mismatch {
                index,
                expected: "header",
            }),
        }
    }

    /// A required header.
    pub fn required_header(&self, index: usize) -> Result<&str, BindError> {
        self.header(index)?.ok_or(BindError::Mismatch {
            index,
            expected: "required header",
        })
    }

    pub fn service<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, BindError> {
        match self.get(index) {
            Some(Argument::Service(instance)) => downcast(index, instance),
            _ => Err(BindError::Mismatch {
                index,
                expected: "service",
            }),
        }
    }

    /// A value produced by a `dynamic` binder.
    pub fn value<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, BindError> {
        match self.get(index) {
            Some(Argument::Value(instance)) => downcast(index, instance),
            _ => Err(BindError::Mismatch {
                index,
                expected: "dynamic value",
            }),
        }
    }

    fn get(&self, index: usize) -> Option<&Argument<M>> {
        self.values.get(index).map(|(_, argument)| argument)
    }
}

fn downcast<T: Any + Send + Sync>(
    index: usize,
    instance: &ServiceInstance,
) -> Result<Arc<T>, BindError> {
    Arc::clone(instance)
        .downcast::<T>()
        .map_err(|_| BindError::Mismatch {
            index,
            expected: type_name::<T>(),
        })
}
