//! Promises whose handlers run on the post-phase queue.
//!
//! A [`Promise`] never calls a handler from inside `resolve`/`reject`.
//! Settling one schedules each attached handler as a post-phase job, so
//! continuation code is charged to the ration like any other callback and
//! runs only after the current phase's own queue has drained. A chain of
//! `then`s costs one post-phase job per hop.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::engine::TickScheduler;

/// Receives the outcome of a settled promise or thenable.
pub type Settle<T, E> = Box<dyn FnOnce(Result<T, E>)>;

enum State<T, E> {
    Pending(SmallVec<[Settle<T, E>; 2]>),
    Settled(Result<T, E>),
}

/// A value that settles at some point, possibly outside the scheduler.
pub trait Thenable<T, E> {
    /// Calls `settle` once the outcome is known, possibly right away.
    fn when_settled(self, settle: Settle<T, E>);
}

/// Adapts a callback-style asynchronous operation.
///
/// The wrapped closure receives the [`Settle`] callback and is expected to
/// invoke it once:
///
/// ```ignore
/// let read = Promise::wrap(&scheduler, FromCallback(|settle| {
///     host.load_file("map.xml", move |data| settle(Ok(data)));
/// }));
/// ```
pub struct FromCallback<F>(pub F);

impl<T, E, F> Thenable<T, E> for FromCallback<F>
where
    F: FnOnce(Settle<T, E>),
{
    fn when_settled(self, settle: Settle<T, E>) {
        (self.0)(settle)
    }
}

impl<T, E> Thenable<T, E> for Result<T, E> {
    fn when_settled(self, settle: Settle<T, E>) {
        settle(self)
    }
}

pub struct Promise<T, E> {
    state: Rc<RefCell<State<T, E>>>,
    scheduler: Rc<TickScheduler>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            scheduler: Rc::clone(&self.scheduler),
        }
    }
}

/// Settles the promise it was created with. Only the first settlement counts.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, reason: E) {
        self.settle(Err(reason));
    }

    pub fn settle(&self, result: Result<T, E>) {
        self.promise.settle(result);
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Creates a promise and runs `executor` immediately with its resolver.
    pub fn new(scheduler: &Rc<TickScheduler>, executor: impl FnOnce(Resolver<T, E>)) -> Self {
        let (promise, resolver) = Self::pending(scheduler);
        executor(resolver);
        promise
    }

    pub fn pending(scheduler: &Rc<TickScheduler>) -> (Self, Resolver<T, E>) {
        let promise = Self {
            state: Rc::new(RefCell::new(State::Pending(SmallVec::new()))),
            scheduler: Rc::clone(scheduler),
        };
        let resolver = Resolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    pub fn resolved(scheduler: &Rc<TickScheduler>, value: T) -> Self {
        Self::settled(scheduler, Ok(value))
    }

    pub fn rejected(scheduler: &Rc<TickScheduler>, reason: E) -> Self {
        Self::settled(scheduler, Err(reason))
    }

    fn settled(scheduler: &Rc<TickScheduler>, result: Result<T, E>) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Settled(result))),
            scheduler: Rc::clone(scheduler),
        }
    }

    /// Adapts a continuation produced elsewhere so that its handlers run
    /// through the post-phase queue.
    pub fn wrap(scheduler: &Rc<TickScheduler>, source: impl Thenable<T, E>) -> Self {
        let (promise, resolver) = Self::pending(scheduler);
        source.when_settled(Box::new(move |result| resolver.settle(result)));
        promise
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::Pending(_))
    }

    /// The outcome, once settled.
    pub fn result(&self) -> Option<Result<T, E>> {
        match &*self.state.borrow() {
            State::Pending(_) => None,
            State::Settled(result) => Some(result.clone()),
        }
    }

    fn settle(&self, result: Result<T, E>) {
        let subscribers = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Settled(_) => return,
                State::Pending(subscribers) => {
                    let subscribers = mem::take(subscribers);
                    *state = State::Settled(result.clone());
                    subscribers
                }
            }
        };
        for subscriber in subscribers {
            subscriber(result.clone());
        }
    }

    /// Runs `subscriber` synchronously on settlement. Internal plumbing only;
    /// user handlers go through [`react`](Self::react).
    fn subscribe(&self, subscriber: Settle<T, E>) {
        let settled = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Pending(subscribers) => {
                    subscribers.push(subscriber);
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };
        subscriber(settled);
    }

    /// Schedules `handler` onto the post-phase queue once this settles.
    fn react(&self, handler: impl FnOnce(Result<T, E>) + 'static) {
        let scheduler = Rc::clone(&self.scheduler);
        self.subscribe(Box::new(move |result| {
            scheduler.post_phase(move || handler(result));
        }));
    }

    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then_or(move |value| Ok(on_fulfilled(value)), Err)
    }

    /// `then` with a handler that itself returns a promise. The returned
    /// promise settles with it, without an extra post-phase hop.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U, E> + 'static,
    {
        let (derived, resolver) = Promise::pending(&self.scheduler);
        self.react(move |result| match result {
            Ok(value) => {
                on_fulfilled(value).subscribe(Box::new(move |inner| resolver.settle(inner)))
            }
            Err(reason) => resolver.reject(reason),
        });
        derived
    }

    /// Handles a rejection. Returning `Ok` recovers the chain.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T, E>
    where
        F: FnOnce(E) -> Result<T, E> + 'static,
    {
        self.then_or(Ok, on_rejected)
    }

    /// The two-handler form of `then`.
    pub fn then_or<U, F, G>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
        G: FnOnce(E) -> Result<U, E> + 'static,
    {
        let (derived, resolver) = Promise::pending(&self.scheduler);
        self.react(move |result| {
            resolver.settle(match result {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            })
        });
        derived
    }

    /// Observes the outcome without producing a new promise.
    pub fn on_settled<F>(&self, handler: F)
    where
        F: FnOnce(Result<T, E>) + 'static,
    {
        self.react(handler);
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn when_settled(self, settle: Settle<T, E>) {
        self.subscribe(settle);
    }
}

/// Turns a function returning any [`Thenable`] into one returning a
/// [`Promise`] that follows the scheduler's rules.
pub fn reasync<A, T, E, R, F>(
    scheduler: &Rc<TickScheduler>,
    f: F,
) -> impl Fn(A) -> Promise<T, E> + 'static
where
    T: Clone + 'static,
    E: Clone + 'static,
    R: Thenable<T, E>,
    F: Fn(A) -> R + 'static,
{
    let scheduler = Rc::clone(scheduler);
    move |args| Promise::wrap(&scheduler, f(args))
}
