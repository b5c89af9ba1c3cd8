//! Shared fakes for unit tests.

use crate::error::IncidentError;
use crate::llm::{ChatMessage, Inference, InferenceParams};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Answers from a fixed script, one reply per call. An exhausted script
/// fails every further call with a service error.
#[derive(Default)]
pub(crate) struct ScriptedInference {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<(Vec<ChatMessage>, InferenceParams)>>,
}

impl ScriptedInference {
    pub(crate) fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::scripted(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub(crate) fn scripted(replies: impl IntoIterator<Item = Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> Vec<(Vec<ChatMessage>, InferenceParams)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Inference for ScriptedInference {
    fn infer<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        params: InferenceParams,
    ) -> BoxFuture<'a, Result<String, IncidentError>> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((messages.to_vec(), params));
        let next = self.replies.lock().expect("replies lock").pop_front();
        async move {
            match next {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(err)) => Err(IncidentError::Service(err)),
                None => Err(IncidentError::Service("model unavailable".into())),
            }
        }
        .boxed()
    }
}
