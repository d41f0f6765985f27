//! Two-tier DAG scheduler over the specialist agents.
//!
//! Research agents (market_data, fundamentals, sentiment, macro) fan out
//! first; synthesis agents (technical_analysis, advisor) are only reachable
//! through the research gate once no research work remains pending. A router
//! pass before every dispatch converts dependency failures into transitive
//! skips, and a hard recursion cap bounds the loop for any plan shape.

use std::collections::HashMap;

use futures_util::future::join_all;
use tracing::{debug, error, warn};

use crate::agents::{self, AgentContext, EventSink};
use crate::models::{
    AgentName, AgentUpdate, DecisionStep, ExecutionPlan, StreamEvent, TaskState,
};
use crate::state::AppDeps;
use crate::supervisor::{aggregator, planner, ConversationState};

pub const RECURSION_LIMIT: u32 = 25;

const FATAL_FALLBACK: &str = "I hit an internal error while running this analysis.";

/// Mark pending tasks whose any dependency failed or was skipped. Transitive:
/// repeated router passes propagate skips down the DAG.
pub fn mark_blocked_tasks_skipped(
    plan: &ExecutionPlan,
    task_status: &mut HashMap<String, TaskState>,
) -> Vec<String> {
    let mut newly_skipped = Vec::new();
    for step in &plan.steps {
        let current = task_status
            .get(&step.task_id)
            .copied()
            .unwrap_or(TaskState::Pending);
        if current != TaskState::Pending {
            continue;
        }
        let blocked = step.depends_on.iter().any(|dep| {
            matches!(
                task_status.get(dep),
                Some(TaskState::Failed) | Some(TaskState::Skipped)
            )
        });
        if blocked {
            task_status.insert(step.task_id.clone(), TaskState::Skipped);
            newly_skipped.push(step.task_id.clone());
        }
    }
    newly_skipped
}

pub fn all_terminal(plan: &ExecutionPlan, task_status: &HashMap<String, TaskState>) -> bool {
    plan.steps.iter().all(|step| {
        task_status
            .get(&step.task_id)
            .copied()
            .unwrap_or(TaskState::Pending)
            .is_terminal()
    })
}

/// Agents in the given tier that own at least one ready task, deduplicated in
/// plan order.
pub fn ready_agents_from_tier(
    plan: &ExecutionPlan,
    task_status: &HashMap<String, TaskState>,
    research: bool,
) -> Vec<AgentName> {
    let mut out = Vec::new();
    for step in &plan.steps {
        if step.agent.is_research() != research {
            continue;
        }
        let state = task_status
            .get(&step.task_id)
            .copied()
            .unwrap_or(TaskState::Pending);
        if state != TaskState::Pending {
            continue;
        }
        if !agents::deps_satisfied(step, task_status) {
            continue;
        }
        if !out.contains(&step.agent) {
            out.push(step.agent);
        }
    }
    out
}

fn research_pending(plan: &ExecutionPlan, task_status: &HashMap<String, TaskState>) -> bool {
    plan.steps.iter().any(|step| {
        step.agent.is_research()
            && task_status
                .get(&step.task_id)
                .copied()
                .unwrap_or(TaskState::Pending)
                == TaskState::Pending
    })
}

/// Merge an agent's update into the turn state. Terminal task states never
/// transition; an agent cannot resurrect or overwrite a finished task.
fn merge_update(state: &mut ConversationState, update: AgentUpdate, events: &EventSink) {
    for (agent, result) in update.agent_results {
        state.agent_results.insert(agent, result);
    }
    for (task_id, new_state) in update.task_status {
        let current = state
            .task_status
            .get(&task_id)
            .copied()
            .unwrap_or(TaskState::Pending);
        if current.is_terminal() {
            if current != new_state {
                warn!(task_id = %task_id, from = current.as_str(), to = new_state.as_str(),
                    "ignoring transition out of terminal task state");
            }
            continue;
        }
        state.task_status.insert(task_id.clone(), new_state);
        events.emit(StreamEvent::TaskUpdate {
            task_id,
            status: new_state.as_str().to_string(),
        });
    }
}

async fn dispatch_agents(
    deps: &AppDeps,
    state: &mut ConversationState,
    agents_to_run: Vec<AgentName>,
    events: &EventSink,
) {
    let plan = state.plan.clone().expect("dispatch requires a plan");
    let task_status = state.task_status.clone();
    let agent_results = state.agent_results.clone();
    let messages = state.messages.clone();

    let runs = agents_to_run.iter().map(|agent| {
        let ctx = AgentContext {
            deps,
            plan: &plan,
            task_status: &task_status,
            agent_results: &agent_results,
            messages: &messages,
            events: events.clone(),
        };
        let agent = *agent;
        async move {
            let update = agents::run_agent(agent, &ctx).await;
            (agent, update)
        }
    });

    for agent in &agents_to_run {
        events.emit(StreamEvent::AgentStart {
            agent: agent.as_str().to_string(),
        });
    }
    let updates = join_all(runs).await;
    for (agent, update) in updates {
        // A specialist that returns without claiming its ready tasks is a
        // bug; surface it loudly instead of looping forever.
        if update.task_status.is_empty() {
            error!(agent = agent.as_str(), "agent returned no task status updates");
        }
        merge_update(state, update, events);
        events.emit(StreamEvent::AgentEnd {
            agent: agent.as_str().to_string(),
        });
    }
}

/// Run one full chat turn: plan, schedule the DAG, aggregate, persist.
pub async fn run_turn(deps: &AppDeps, mut state: ConversationState, events: EventSink) -> ConversationState {
    // Planner node.
    events.emit(StreamEvent::AgentStart {
        agent: "planner".to_string(),
    });
    let outcome = planner::plan_turn(deps, &state).await;
    state.task_status = outcome.task_status;
    state.memory_context = outcome.memory_context;
    state.plan = Some(outcome.plan);
    events.emit(StreamEvent::AgentEnd {
        agent: "planner".to_string(),
    });

    if let Some(ref plan) = state.plan {
        let steps = plan
            .steps
            .iter()
            .map(|s| DecisionStep {
                task_id: s.task_id.clone(),
                agent: s.agent.as_str().to_string(),
                query: s.query.clone(),
                depends_on: s.depends_on.clone(),
            })
            .collect();
        events.emit(StreamEvent::Decision {
            reasoning: plan.reasoning.clone(),
            steps,
        });
    }

    let mut transitions = 0u32;
    loop {
        transitions += 1;
        if transitions > RECURSION_LIMIT {
            error!(limit = RECURSION_LIMIT, "scheduler recursion cap exceeded");
            events.emit(StreamEvent::Error {
                message: format!("Scheduler exceeded {RECURSION_LIMIT} routing steps."),
            });
            state.final_response = FATAL_FALLBACK.to_string();
            return state;
        }

        let plan = state.plan.clone().expect("plan set by planner");

        // Router: propagate failures/skips before picking the next node.
        let newly_skipped = mark_blocked_tasks_skipped(&plan, &mut state.task_status);
        for task_id in newly_skipped {
            events.emit(StreamEvent::TaskUpdate {
                task_id,
                status: TaskState::Skipped.as_str().to_string(),
            });
        }

        if all_terminal(&plan, &state.task_status) {
            break;
        }

        let ready_research = ready_agents_from_tier(&plan, &state.task_status, true);
        if !ready_research.is_empty() {
            debug!(agents = ?ready_research, "dispatching research tier");
            dispatch_agents(deps, &mut state, ready_research, &events).await;
            continue;
        }

        if !research_pending(&plan, &state.task_status) {
            // Research gate: synthesis agents only run past this point.
            let ready_synthesis = ready_agents_from_tier(&plan, &state.task_status, false);
            if ready_synthesis.is_empty() {
                break;
            }
            debug!(agents = ?ready_synthesis, "dispatching synthesis tier");
            dispatch_agents(deps, &mut state, ready_synthesis, &events).await;
            continue;
        }

        // Research tasks still pending but none dispatchable: nothing can
        // make progress, hand off to the aggregator.
        warn!("no dispatchable tasks remain; aggregating early");
        break;
    }

    aggregator::aggregate(deps, &mut state).await;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentTask;

    fn task(id: &str, agent: AgentName, deps: &[&str]) -> AgentTask {
        AgentTask {
            task_id: id.to_string(),
            agent,
            query: String::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn plan(steps: Vec<AgentTask>) -> ExecutionPlan {
        ExecutionPlan {
            reasoning: String::new(),
            steps,
            parallel_groups: Vec::new(),
        }
    }

    #[test]
    fn skip_propagation_is_transitive() {
        let p = plan(vec![
            task("t1", AgentName::MarketData, &[]),
            task("t2", AgentName::TechnicalAnalysis, &["t1"]),
            task("t3", AgentName::Advisor, &["t2"]),
        ]);
        let mut status = HashMap::new();
        status.insert("t1".to_string(), TaskState::Failed);
        status.insert("t2".to_string(), TaskState::Pending);
        status.insert("t3".to_string(), TaskState::Pending);

        let first = mark_blocked_tasks_skipped(&p, &mut status);
        assert_eq!(first, vec!["t2"]);
        let second = mark_blocked_tasks_skipped(&p, &mut status);
        assert_eq!(second, vec!["t3"]);
        assert_eq!(status["t3"], TaskState::Skipped);
        assert!(all_terminal(&p, &status));
    }

    #[test]
    fn ready_agents_respect_tiers() {
        let p = plan(vec![
            task("t1", AgentName::MarketData, &[]),
            task("t2", AgentName::Sentiment, &[]),
            task("t3", AgentName::TechnicalAnalysis, &["t1"]),
        ]);
        let mut status: HashMap<String, TaskState> = HashMap::new();
        for id in ["t1", "t2", "t3"] {
            status.insert(id.to_string(), TaskState::Pending);
        }

        let research = ready_agents_from_tier(&p, &status, true);
        assert_eq!(research, vec![AgentName::MarketData, AgentName::Sentiment]);
        // Technical blocked behind t1 and in the other tier anyway.
        assert!(ready_agents_from_tier(&p, &status, false).is_empty());

        status.insert("t1".to_string(), TaskState::Completed);
        status.insert("t2".to_string(), TaskState::Completed);
        assert_eq!(
            ready_agents_from_tier(&p, &status, false),
            vec![AgentName::TechnicalAnalysis]
        );
    }

    #[test]
    fn terminal_states_never_transition_on_merge() {
        let mut state = ConversationState {
            plan: Some(plan(vec![task("t1", AgentName::MarketData, &[])])),
            ..Default::default()
        };
        state.task_status.insert("t1".to_string(), TaskState::Failed);

        let mut update = AgentUpdate::default();
        update.task_status.insert("t1".to_string(), TaskState::Completed);
        merge_update(&mut state, update, &EventSink::none());
        assert_eq!(state.task_status["t1"], TaskState::Failed);
    }

    #[test]
    fn duplicate_agents_collapse_to_one_dispatch() {
        let p = plan(vec![
            task("t1", AgentName::MarketData, &[]),
            task("t2", AgentName::MarketData, &[]),
        ]);
        let status: HashMap<String, TaskState> = [
            ("t1".to_string(), TaskState::Pending),
            ("t2".to_string(), TaskState::Pending),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            ready_agents_from_tier(&p, &status, true),
            vec![AgentName::MarketData]
        );
    }
}
