//! Procedure registry.
//!
//! Application functions of any arity up to seven are registered as plain
//! closures or `fn` items. Each one is wrapped in a [`ProcedureHandler`] that
//! decodes the typed arguments, invokes the function and encodes its result,
//! behind the object-safe [`Handler`] trait so a single table can hold them
//! all.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::protocol::codec::{Marshal, Marshaller, Unmarshal, Unmarshaller};

/// Type-erased procedure: decode, invoke, encode.
pub trait Handler: Send + Sync {
    /// Decodes arguments from `args`, runs the procedure and packs the result
    /// into `reply`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmarshalArgs`] if the arguments do not decode
    /// exactly. `reply` must not be trusted in that case.
    fn handle(&self, args: &mut Unmarshaller, reply: &mut Marshaller) -> Result<()>;
}

/// A typed function callable with a decoded argument tuple.
///
/// Implemented for every `Fn(A1, .., An) -> R` with `n <= 7` where each
/// argument implements [`Unmarshal`] and `R` implements [`Marshal`].
pub trait Procedure<Args>: Send + Sync + 'static {
    /// Result type sent back to the caller.
    type Output: Marshal;

    /// Calls the function.
    fn invoke(&self, args: Args) -> Self::Output;
}

macro_rules! impl_procedure {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> Procedure<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + Send + Sync + 'static,
            Ret: Marshal,
        {
            type Output = Ret;

            #[allow(non_snake_case, clippy::unused_unit)]
            fn invoke(&self, ($($arg,)*): ($($arg,)*)) -> Ret {
                self($($arg),*)
            }
        }
    };
}

impl_procedure!();
impl_procedure!(A1);
impl_procedure!(A1, A2);
impl_procedure!(A1, A2, A3);
impl_procedure!(A1, A2, A3, A4);
impl_procedure!(A1, A2, A3, A4, A5);
impl_procedure!(A1, A2, A3, A4, A5, A6);
impl_procedure!(A1, A2, A3, A4, A5, A6, A7);

/// [`Handler`] built from a typed [`Procedure`].
pub struct ProcedureHandler<P, Args> {
    procedure: P,
    _args: PhantomData<fn(Args)>,
}

impl<P, Args> ProcedureHandler<P, Args>
where
    P: Procedure<Args>,
    Args: Unmarshal,
{
    /// Wraps `procedure`.
    pub const fn new(procedure: P) -> Self {
        Self {
            procedure,
            _args: PhantomData,
        }
    }
}

impl<P, Args> Handler for ProcedureHandler<P, Args>
where
    P: Procedure<Args>,
    Args: Unmarshal,
{
    fn handle(&self, args: &mut Unmarshaller, reply: &mut Marshaller) -> Result<()> {
        let decoded: Args = args.unpack();
        if !args.fully_consumed() {
            return Err(Error::UnmarshalArgs);
        }

        let output = self.procedure.invoke(decoded);
        reply.pack(&output);
        Ok(())
    }
}

/// Procedure table keyed by proc id.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<u32, Box<dyn Handler>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed function under `proc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateProcedure`] if the id is taken.
    pub fn register<P, Args>(&mut self, proc_id: u32, procedure: P) -> Result<()>
    where
        P: Procedure<Args>,
        Args: Unmarshal + 'static,
    {
        self.register_handler(proc_id, Box::new(ProcedureHandler::new(procedure)))
    }

    /// Registers a hand-written handler under `proc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateProcedure`] if the id is taken.
    pub fn register_handler(&mut self, proc_id: u32, handler: Box<dyn Handler>) -> Result<()> {
        if self.handlers.contains_key(&proc_id) {
            return Err(Error::DuplicateProcedure(proc_id));
        }
        self.handlers.insert(proc_id, handler);
        Ok(())
    }

    /// Looks up the handler for `proc_id`.
    #[must_use]
    pub fn get(&self, proc_id: u32) -> Option<&dyn Handler> {
        self.handlers.get(&proc_id).map(AsRef::as_ref)
    }

    /// Whether `proc_id` is registered.
    #[must_use]
    pub fn contains(&self, proc_id: u32) -> bool {
        self.handlers.contains_key(&proc_id)
    }

    /// Number of registered procedures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().collect();
        ids.sort_unstable();
        f.debug_struct("Registry").field("procedures", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn args_of(m: &Marshaller) -> Unmarshaller {
        Unmarshaller::new(Bytes::copy_from_slice(m.payload()))
    }

    fn run(handler: &dyn Handler, args: &Marshaller) -> Result<Unmarshaller> {
        let mut reply = Marshaller::new();
        handler.handle(&mut args_of(args), &mut reply)?;
        Ok(Unmarshaller::new(Bytes::copy_from_slice(reply.payload())))
    }

    #[test]
    fn test_decode_invoke_encode() {
        let mut registry = Registry::new();
        registry
            .register(0x7001, |clt: u32, var: u64| i32::try_from(var).unwrap() + clt as i32)
            .unwrap();

        let mut args = Marshaller::new();
        args.pack(&2u32).pack(&40u64);

        let mut reply = run(registry.get(0x7001).unwrap(), &args).unwrap();
        assert_eq!(reply.unpack::<i32>(), 42);
        assert!(reply.fully_consumed());
    }

    #[test]
    fn test_zero_argument_procedure() {
        let mut registry = Registry::new();
        registry.register(9, || String::from("pong")).unwrap();

        let mut reply = run(registry.get(9).unwrap(), &Marshaller::new()).unwrap();
        assert_eq!(reply.unpack::<String>(), "pong");
    }

    #[test]
    fn test_short_arguments_fail_without_invoking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler = ProcedureHandler::new(move |_: u64| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut args = Marshaller::new();
        args.pack(&1u32);

        assert!(matches!(run(&handler, &args), Err(Error::UnmarshalArgs)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_trailing_arguments_fail() {
        let handler = ProcedureHandler::new(|x: u32| x);
        let mut args = Marshaller::new();
        args.pack(&1u32).pack(&2u32);

        assert!(matches!(run(&handler, &args), Err(Error::UnmarshalArgs)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = Registry::new();
        registry.register(5, |x: u32| x).unwrap();
        let result = registry.register(5, |x: String| x);

        assert!(matches!(result, Err(Error::DuplicateProcedure(5))));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(5));
        assert!(registry.get(6).is_none());
    }
}
