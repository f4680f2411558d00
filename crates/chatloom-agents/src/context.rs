use chatloom_db::AgentProfile;

/// Authenticated identity of one API call, passed explicitly to every
/// orchestrator, catalog, invoker and conversation-service operation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub application_id: String,
    pub agent: AgentProfile,
}

impl RequestContext {
    pub fn new(agent: AgentProfile) -> Self {
        Self {
            application_id: agent.application_id.clone(),
            agent,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }
}
