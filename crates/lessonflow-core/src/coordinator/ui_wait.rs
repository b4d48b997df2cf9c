// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serialized UI interactions on their own task.
//!
//! Some interactions must happen strictly in order while the rest of the
//! session keeps flowing, e.g. pausing the scenario, showing a survey and
//! resuming. They run on a dedicated task so that the task delivering
//! replies is never the one waiting for them.

use std::future::Future;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a spawned UI interaction.
#[derive(Debug)]
pub struct UiWait<T> {
    result: oneshot::Receiver<T>,
}

impl<T> UiWait<T> {
    /// Wait for the interaction. `None` if the session started closing first.
    pub async fn wait(self) -> Option<T> {
        self.result.await.ok()
    }
}

/// Run `interaction` on its own task, abandoning it when `closing` fires.
pub fn spawn_serialized<F, T>(closing: CancellationToken, interaction: F) -> UiWait<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = closing.cancelled() => {
                debug!("Abandoning UI interaction; session is closing");
            }
            output = interaction => {
                let _ = tx.send(output);
            }
        }
    });
    UiWait { result: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interaction_result_is_returned() {
        let wait = spawn_serialized(CancellationToken::new(), async { 41 + 1 });
        assert_eq!(wait.wait().await, Some(42));
    }

    #[tokio::test]
    async fn test_closing_abandons_interaction() {
        let closing = CancellationToken::new();
        let wait = spawn_serialized(closing.clone(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "never"
        });

        closing.cancel();
        assert_eq!(wait.wait().await, None);
    }
}
