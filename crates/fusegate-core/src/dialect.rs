// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Addressing dialects
//!
//! The queue, gate, dispatcher and mount controller are written once and
//! instantiated per dialect. A dialect names its closed set of operations,
//! the tagged call type carrying each operation's owned arguments and typed
//! completion, and the registry of handlers for those operations.
//!
//! The concrete types are generated by [`dialect!`] from a table of
//! `Variant => method(Args) -> Payload` rows, which keeps the operation enum,
//! the call enum and the registry's builder methods from drifting apart.

use std::fmt;

use crate::error::Errno;
use crate::registry::Lifecycle;

/// A closed enumeration of the operations of one dialect
pub trait Operation: Copy + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Lower-case operation name as used in logs and configuration
    fn name(self) -> &'static str;
}

/// One addressing convention for filesystem calls
pub trait Dialect: Sized + 'static {
    const NAME: &'static str;

    type Op: Operation;
    /// A call in flight: owned arguments plus its completion
    type Call: Send + 'static;
    type Handlers: 'static;

    fn op(call: &Self::Call) -> Self::Op;

    /// Hand `call` to its registered handler, or complete it with the
    /// default outcome when none is registered
    fn dispatch(handlers: &Self::Handlers, call: Self::Call);

    /// Complete `call` with `errno` without running any handler
    fn reject(call: Self::Call, errno: Errno);

    fn lifecycle(handlers: &Self::Handlers) -> &Lifecycle;
}

macro_rules! missing_handler {
    ($done:ident) => {
        $crate::registry::unsupported($done)
    };
    ($done:ident, $missing:path) => {
        $missing($done)
    };
}

macro_rules! dialect {
    (
        $(#[$dmeta:meta])*
        $dialect:ident ($name:literal) {
            op: $op:ident,
            call: $call:ident,
            handlers: $handlers:ident $(,)?
        }
        $(
            $(#[$vmeta:meta])*
            $variant:ident => $method:ident ( $args:ty ) -> $payload:ty $(, missing $missing:path)? ;
        )+
    ) => {
        #[doc = concat!("Operations of the ", $name, " dialect")]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $op {
            $( $variant, )+
        }

        impl $op {
            pub const ALL: &'static [$op] = &[ $( $op::$variant, )+ ];

            pub fn name(self) -> &'static str {
                match self {
                    $( $op::$variant => stringify!($method), )+
                }
            }
        }

        impl $crate::dialect::Operation for $op {
            fn name(self) -> &'static str {
                $op::name(self)
            }
        }

        impl ::std::fmt::Display for $op {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl ::std::str::FromStr for $op {
            type Err = $crate::error::BridgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $op::ALL
                    .iter()
                    .copied()
                    .find(|op| op.name() == s)
                    .ok_or_else(|| $crate::error::BridgeError::UnknownOperation(s.to_string()))
            }
        }

        #[doc = concat!("A ", $name, "-dialect call in flight")]
        pub enum $call {
            $(
                $(#[$vmeta])*
                $variant {
                    args: $args,
                    done: $crate::gate::Completion<$payload>,
                },
            )+
        }

        impl $call {
            $(
                pub fn $method(args: $args, done: $crate::gate::Completion<$payload>) -> Self {
                    $call::$variant { args, done }
                }
            )+

            pub fn op(&self) -> $op {
                match self {
                    $( $call::$variant { .. } => $op::$variant, )+
                }
            }

            pub fn reject(self, errno: $crate::error::Errno) {
                match self {
                    $( $call::$variant { done, .. } => done.error(errno), )+
                }
            }
        }

        impl ::std::fmt::Debug for $call {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    $( $call::$variant { args, .. } => f
                        .debug_struct(stringify!($variant))
                        .field("args", args)
                        .finish_non_exhaustive(), )+
                }
            }
        }

        #[doc = concat!("Handlers registered for a ", $name, "-dialect mount")]
        ///
        /// Built once, then moved into the mount. Every operation left
        /// unregistered answers `ENOSYS`, except the lifecycle hooks and
        /// reply-less calls, which succeed.
        #[derive(Default)]
        pub struct $handlers {
            lifecycle: $crate::registry::Lifecycle,
            $( $method: Option<$crate::registry::Handler<$args, $payload>>, )+
        }

        impl $handlers {
            pub fn new() -> Self {
                Self::default()
            }

            /// Runs once before any data operation is dispatched
            pub fn init(mut self, hook: impl Fn($crate::gate::Completion<()>) + 'static) -> Self {
                self.lifecycle.init = Some(Box::new(hook));
                self
            }

            /// Runs once after the transport stopped delivering calls
            pub fn destroy(mut self, hook: impl Fn($crate::gate::Completion<()>) + 'static) -> Self {
                self.lifecycle.destroy = Some(Box::new(hook));
                self
            }

            $(
                $(#[$vmeta])*
                pub fn $method(
                    mut self,
                    handler: impl Fn($args, $crate::gate::Completion<$payload>) + 'static,
                ) -> Self {
                    self.$method = Some(Box::new(handler));
                    self
                }
            )+

            pub fn implements(&self, op: $op) -> bool {
                match op {
                    $( $op::$variant => self.$method.is_some(), )+
                }
            }

            pub fn implemented(&self) -> Vec<$op> {
                $op::ALL.iter().copied().filter(|op| self.implements(*op)).collect()
            }

            fn dispatch(&self, call: $call) {
                match call {
                    $(
                        $call::$variant { args, done } => match &self.$method {
                            Some(handler) => handler(args, done),
                            None => missing_handler!(done $(, $missing)?),
                        },
                    )+
                }
            }
        }

        impl ::std::fmt::Debug for $handlers {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(stringify!($handlers))
                    .field("init", &self.lifecycle.has_init())
                    .field("destroy", &self.lifecycle.has_destroy())
                    .field("implemented", &self.implemented())
                    .finish()
            }
        }

        $(#[$dmeta])*
        #[derive(Clone, Copy, Debug)]
        pub struct $dialect;

        impl $crate::dialect::Dialect for $dialect {
            const NAME: &'static str = $name;

            type Op = $op;
            type Call = $call;
            type Handlers = $handlers;

            fn op(call: &$call) -> $op {
                call.op()
            }

            fn dispatch(handlers: &$handlers, call: $call) {
                handlers.dispatch(call)
            }

            fn reject(call: $call, errno: $crate::error::Errno) {
                call.reject(errno)
            }

            fn lifecycle(handlers: &$handlers) -> &$crate::registry::Lifecycle {
                &handlers.lifecycle
            }
        }
    };
}
