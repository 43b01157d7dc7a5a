// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actor registry: lifecycle transitions and callback supervision.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pegboard_protocol::{ActorState, CommandStartActor, Event, StopCode};
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};
use crate::state::{ActorInstance, Shared};

/// Apply a start command: register the instance, announce it as running,
/// and kick off the host's start callback. A failed or expired callback
/// is treated as an immediate stop.
pub(crate) async fn handle_start(shared: &Arc<Shared>, cmd: CommandStartActor) {
    let CommandStartActor {
        actor_id,
        generation,
        config,
    } = cmd;

    {
        let mut st = shared.state.lock().await;
        let instance = ActorInstance {
            generation,
            config: config.clone(),
        };
        if st.actors.insert(actor_id.clone(), instance).is_some() {
            warn!(%actor_id, "start command for an actor already registered, replacing");
        }
        st.emit_event(Event::ActorStateUpdate {
            actor_id: actor_id.clone(),
            generation,
            state: ActorState::Running,
        });
        debug!(%actor_id, generation, "actor registered");
    }

    let shared = shared.clone();
    tokio::spawn(async move {
        let result = with_deadline(
            shared.config.actor_callback_timeout_ms,
            shared
                .host
                .on_actor_start(actor_id.clone(), generation, config),
        )
        .await;

        if let Err(err) = result {
            warn!(%actor_id, generation, %err, "actor start callback failed, stopping actor");
            handle_stop(&shared, &actor_id, generation).await;
        }
    });
}

/// Apply a stop: remove the instance (generation-checked), then release
/// tunnel state, run the host's stop callback once, and announce the stop.
pub(crate) async fn handle_stop(shared: &Arc<Shared>, actor_id: &str, generation: u32) {
    let removed = {
        let mut st = shared.state.lock().await;
        take_for_stop(&mut st.actors, actor_id, generation)
    };
    if removed.is_none() {
        return;
    }

    let shared = shared.clone();
    let actor_id = actor_id.to_string();
    tokio::spawn(async move {
        shared.tunnel.unregister_actor(&actor_id, generation).await;

        let result = with_deadline(
            shared.config.actor_callback_timeout_ms,
            shared.host.on_actor_stop(actor_id.clone(), generation),
        )
        .await;
        if let Err(err) = result {
            warn!(%actor_id, generation, %err, "actor stop callback failed");
        }

        let mut st = shared.state.lock().await;
        st.emit_event(Event::ActorStateUpdate {
            actor_id,
            generation,
            state: ActorState::Stopped {
                code: StopCode::Ok,
                message: "stopped".to_string(),
            },
        });
    });
}

/// Stop every registered actor. Runs when the runner-lost deadline fires.
pub(crate) async fn bulk_teardown(shared: &Arc<Shared>) {
    let actors: Vec<(String, u32)> = {
        let st = shared.state.lock().await;
        st.actors
            .iter()
            .map(|(id, instance)| (id.clone(), instance.generation))
            .collect()
    };
    if actors.is_empty() {
        return;
    }

    warn!(count = actors.len(), "stopping all actors");
    for (actor_id, generation) in actors {
        handle_stop(shared, &actor_id, generation).await;
    }
}

/// Remove an actor for stopping, re-checking its generation. A stale
/// generation means the actor was already replaced; the stop is ignored.
fn take_for_stop(
    actors: &mut HashMap<String, ActorInstance>,
    actor_id: &str,
    generation: u32,
) -> Option<ActorInstance> {
    match actors.get(actor_id) {
        Some(instance) if instance.generation == generation => actors.remove(actor_id),
        Some(instance) => {
            warn!(
                %actor_id,
                current = instance.generation,
                requested = generation,
                "stop for stale generation, ignoring"
            );
            None
        }
        None => {
            debug!(%actor_id, "stop for unknown actor, ignoring");
            None
        }
    }
}

/// Run a host callback under the configured deadline. A deadline of 0
/// disables the wrap.
async fn with_deadline<F>(timeout_ms: u64, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    if timeout_ms == 0 {
        return fut.await;
    }
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(RunnerError::CallbackTimeout),
    }
}
