//! Agents: scripts started inside a machine after it is up, in dependency order.

use crate::process::{ContainerProcess, ProcessCommand};
use crate::provision::WorkspaceMachine;
use berth_shared::errors::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Process kind given to agent processes.
pub const AGENT_PROCESS_KIND: &str = "agent";

/// How long a started agent must survive before the next one is launched.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Ids of agents that must be launched first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Shell script run in the machine. Agents without one are ordering-only.
    #[serde(default)]
    pub script: Option<String>,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order agents so that every agent comes after its dependencies.
///
/// Agents keep their declared order where dependencies allow it.
pub fn sort_agents(agents: &[AgentSpec]) -> BerthResult<Vec<AgentSpec>> {
    let by_id: HashMap<&str, &AgentSpec> = agents.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut sorted = Vec::with_capacity(agents.len());

    for agent in agents {
        let mut path = Vec::new();
        visit(agent, &by_id, &mut marks, &mut path, &mut sorted)?;
    }
    Ok(sorted)
}

fn visit<'a>(
    agent: &'a AgentSpec,
    by_id: &HashMap<&'a str, &'a AgentSpec>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    sorted: &mut Vec<AgentSpec>,
) -> BerthResult<()> {
    match marks.get(agent.id.as_str()) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path
                .iter()
                .position(|id| *id == agent.id)
                .unwrap_or_default();
            let mut cycle: Vec<&str> = path[start..].to_vec();
            cycle.push(agent.id.as_str());
            return Err(BerthError::CircularDependency(format!(
                "agents {}",
                cycle.join(" -> ")
            )));
        }
        None => {}
    }

    marks.insert(agent.id.as_str(), Mark::Visiting);
    path.push(agent.id.as_str());
    for dependency in &agent.dependencies {
        let dep = by_id.get(dependency.as_str()).copied().ok_or_else(|| {
            BerthError::NotFound(format!(
                "agent '{}' depends on unknown agent '{}'",
                agent.id, dependency
            ))
        })?;
        visit(dep, by_id, marks, path, sorted)?;
    }
    path.pop();
    marks.insert(agent.id.as_str(), Mark::Done);
    sorted.push(agent.clone());
    Ok(())
}

/// Starts agent scripts as machine processes.
pub struct AgentLauncher {
    startup_grace: Duration,
}

impl AgentLauncher {
    pub fn new() -> Self {
        Self {
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Launch every agent with a script, dependencies first.
    ///
    /// Each script runs in a background task. An agent whose process fails
    /// within the startup grace aborts the remaining sequence.
    pub async fn apply(
        &self,
        machine: &WorkspaceMachine,
        agents: &[AgentSpec],
    ) -> BerthResult<Vec<Arc<ContainerProcess>>> {
        let sorted = sort_agents(agents)?;
        let mut launched = Vec::new();

        for agent in sorted {
            let Some(script) = agent.script.as_deref().filter(|s| !s.trim().is_empty()) else {
                continue;
            };

            let process = machine.create_process(
                ProcessCommand::new(&agent.id, script).with_kind(AGENT_PROCESS_KIND),
                None,
            );
            tracing::info!(
                machine = %machine.machine_name(),
                agent = %agent.id,
                pid = process.pid(),
                "Launching agent"
            );

            let task = {
                let process = Arc::clone(&process);
                tokio::spawn(async move { process.start(None).await })
            };
            tokio::time::sleep(self.startup_grace).await;

            if task.is_finished() {
                match task.await {
                    Ok(Ok(())) => {
                        tracing::debug!(agent = %agent.id, "Agent script finished");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(agent = %agent.id, error = %e, "Agent failed to start");
                        return Err(e);
                    }
                    Err(e) => {
                        return Err(BerthError::Internal(format!(
                            "agent '{}' task failed: {}",
                            agent.id, e
                        )));
                    }
                }
            }
            launched.push(process);
        }
        Ok(launched)
    }
}

impl Default for AgentLauncher {
    fn default() -> Self {
        Self::new()
    }
}
