use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use tracing::warn;

use grounded_core::errors::GatewayError;
use grounded_core::ids::ToolCallId;
use grounded_core::stream::{FinishReason, ProviderDelta, StreamEvent};

pin_project! {
    /// Normalizes raw provider chunks into [`StreamEvent`]s.
    ///
    /// Events come out in exactly the order the provider delivered them.
    /// The sequence always ends with one `End` or `Error` and is fused after
    /// that. A transport fault ends it with `Error`; there is no retry here.
    pub struct TokenStreamReader<S> {
        #[pin]
        inner: S,
        call_ids: HashMap<u32, ToolCallId>,
        pending: VecDeque<StreamEvent>,
        finished: bool,
    }
}

impl<S> TokenStreamReader<S>
where
    S: Stream<Item = Result<ProviderDelta, GatewayError>>,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            call_ids: HashMap::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

/// Translate one chunk, appending events to `out`. Returns true once the
/// provider signalled a finish reason.
fn translate(
    delta: ProviderDelta,
    call_ids: &mut HashMap<u32, ToolCallId>,
    out: &mut VecDeque<StreamEvent>,
) -> bool {
    let Some(choice) = delta.choices.into_iter().find(|c| c.index == 0) else {
        return false;
    };

    if let Some(text) = choice.delta.content {
        if !text.is_empty() {
            out.push_back(StreamEvent::Text { delta: text });
        }
    }

    for chunk in choice.delta.tool_calls {
        let id = match chunk.id {
            Some(raw) => {
                let id = ToolCallId::from_raw(raw);
                call_ids.insert(chunk.index, id.clone());
                id
            }
            None => match call_ids.get(&chunk.index) {
                Some(id) => id.clone(),
                None => {
                    warn!(index = chunk.index, "tool-call fragment without id for unseen index");
                    let id = ToolCallId::new();
                    call_ids.insert(chunk.index, id.clone());
                    id
                }
            },
        };
        let (name, arguments) = match chunk.function {
            Some(f) => (f.name.filter(|n| !n.is_empty()), f.arguments),
            None => (None, None),
        };
        out.push_back(StreamEvent::ToolCallDelta { id, name, arguments });
    }

    match choice.finish_reason {
        Some(reason) => {
            out.push_back(StreamEvent::End {
                reason: FinishReason::from_wire(&reason),
            });
            true
        }
        None => false,
    }
}

impl<S> Stream for TokenStreamReader<S>
where
    S: Stream<Item = Result<ProviderDelta, GatewayError>>,
{
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(delta))) => {
                    if translate(delta, this.call_ids, this.pending) {
                        *this.finished = true;
                    }
                }
                Poll::Ready(Some(Err(error))) => {
                    *this.finished = true;
                    this.pending.push_back(StreamEvent::Error { error });
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    this.pending.push_back(StreamEvent::End {
                        reason: FinishReason::Other("eof".into()),
                    });
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
