use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::Codec;
use crate::{CtxInner, Event, OrchestrationContext};

/// Output of a `DurableFuture` when awaited via unified composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

/// A unified future for activities, timers, and external events. Resolves
/// only from history, so it stays pending for the rest of a turn once its
/// completion is missing.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity { seq: u64, ctx: OrchestrationContext },
    Timer { seq: u64, ctx: OrchestrationContext },
    External { name: String, ordinal: usize, ctx: OrchestrationContext },
}

impl DurableFuture {
    /// Issuance sequence number; `None` for external waits.
    pub fn seq(&self) -> Option<u64> {
        match &self.0 {
            Kind::Activity { seq, .. } | Kind::Timer { seq, .. } => Some(*seq),
            Kind::External { .. } => None,
        }
    }

    fn ctx(&self) -> &OrchestrationContext {
        match &self.0 {
            Kind::Activity { ctx, .. } | Kind::Timer { ctx, .. } | Kind::External { ctx, .. } => ctx,
        }
    }

    /// Locate this future's completion in history: `(history_index, output)`.
    fn lookup(&self, inner: &CtxInner) -> Option<(usize, DurableOutput)> {
        match &self.0 {
            Kind::Activity { seq, .. } => inner.history.iter().enumerate().find_map(|(idx, e)| match e {
                Event::ActivityCompleted { seq: s, result, .. } if s == seq => {
                    Some((idx, DurableOutput::Activity(result.clone())))
                }
                _ => None,
            }),
            Kind::Timer { seq, .. } => inner.history.iter().enumerate().find_map(|(idx, e)| match e {
                Event::TimerFired { seq: s, .. } if s == seq => Some((idx, DurableOutput::Timer)),
                _ => None,
            }),
            Kind::External { name, ordinal, .. } => inner
                .history
                .iter()
                .enumerate()
                .filter_map(|(idx, e)| match e {
                    Event::ExternalEventReceived { name: n, payload, .. } if n == name => {
                        Some((idx, DurableOutput::External(payload.clone())))
                    }
                    _ => None,
                })
                .nth(*ordinal),
        }
    }

    /// Await an activity result as a raw String.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(v) => v,
            other => Err(format!("into_activity used on non-activity future: {other:?}")),
        }
    }

    /// Await an activity result decoded to a typed value.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_activity().await?;
        crate::_typed_codec::Json::decode::<Out>(&s)
    }

    /// Await the timer.
    pub async fn into_timer(self) {
        if let other @ (DurableOutput::Activity(_) | DurableOutput::External(_)) = self.await {
            panic!("into_timer used on non-timer future: {other:?}");
        }
    }

    /// Await the payload of the correlated external event.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(v) => v,
            other => panic!("into_event used on non-external future: {other:?}"),
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx().lock();
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }
        match this.lookup(&inner) {
            Some((idx, out)) => {
                inner.observe(idx);
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

// Aggregate future machinery
enum AggregateMode {
    Select,
    SelectBiased,
    Join,
}

pub enum AggregateOutput {
    Select { winner_index: usize, output: DurableOutput },
    Join { outputs: Vec<DurableOutput> },
}

pub struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    mode: AggregateMode,
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Select,
        }
    }
    pub(crate) fn new_select_biased(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::SelectBiased,
        }
    }
    pub(crate) fn new_join(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Join,
        }
    }
}

impl Future for AggregateDurableFuture {
    type Output = AggregateOutput;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        if inner.nondeterminism.is_some() {
            return Poll::Pending;
        }
        let resolved: Vec<Option<(usize, DurableOutput)>> = this.children.iter().map(|c| c.lookup(&inner)).collect();

        match this.mode {
            AggregateMode::Select | AggregateMode::SelectBiased => {
                let winner = match this.mode {
                    AggregateMode::SelectBiased => resolved.iter().position(Option::is_some),
                    _ => resolved
                        .iter()
                        .enumerate()
                        .filter_map(|(i, r)| r.as_ref().map(|(idx, _)| (*idx, i)))
                        .min()
                        .map(|(_, i)| i),
                };
                let Some(winner_index) = winner else {
                    return Poll::Pending;
                };
                let Some((idx, output)) = resolved.into_iter().nth(winner_index).flatten() else {
                    return Poll::Pending;
                };
                // Only the winner is consumed; losers leave the logical clock alone
                inner.observe(idx);
                Poll::Ready(AggregateOutput::Select { winner_index, output })
            }
            AggregateMode::Join => {
                if resolved.iter().any(Option::is_none) {
                    return Poll::Pending;
                }
                let mut outputs = Vec::with_capacity(resolved.len());
                for (idx, output) in resolved.into_iter().flatten() {
                    inner.observe(idx);
                    outputs.push(output);
                }
                Poll::Ready(AggregateOutput::Join { outputs })
            }
        }
    }
}

pub struct SelectFuture(pub(crate) AggregateDurableFuture);
impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(AggregateOutput::Select { winner_index, output }) => Poll::Ready((winner_index, output)),
            Poll::Ready(AggregateOutput::Join { .. }) => unreachable!("select future produced a join output"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct JoinFuture(pub(crate) AggregateDurableFuture);
impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(AggregateOutput::Join { outputs }) => Poll::Ready(outputs),
            Poll::Ready(AggregateOutput::Select { .. }) => unreachable!("join future produced a select output"),
            Poll::Pending => Poll::Pending,
        }
    }
}
