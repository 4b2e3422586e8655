use crate::message::Message;
use async_trait::async_trait;
use switchyard_events::AgentStatus;
use switchyard_core::SwitchyardResult;

/// A processing unit that receives messages from the bus.
///
/// The bus only depends on this capability set; what an agent does with a
/// message is its own business.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique id used for addressing.
    fn id(&self) -> &str;

    /// Role of the agent, e.g. `planner` or `verifier`.
    fn kind(&self) -> &str;

    /// Capabilities advertised in the agent's initial state.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle one delivered message. An error counts as a failed attempt.
    async fn handle_message(&self, message: &Message) -> SwitchyardResult<()>;

    /// The agent's own view of its status.
    fn state(&self) -> AgentStatus;

    /// Called by the bus on lifecycle transitions such as shutdown.
    fn set_state(&self, status: AgentStatus);

    /// Polled by the health checker.
    fn is_healthy(&self) -> bool {
        self.state() != AgentStatus::Error
    }
}
