use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use weave_core::config::AgentEntry;
use weave_core::error::{Result, WeaveError};
use weave_core::traits::{Agent, AgentDirectory};
use weave_core::types::{AgentInfo, AgentStatus};

struct Entry {
    info: AgentInfo,
    handle: Option<Arc<dyn Agent>>,
}

/// In-memory agent directory.
///
/// Agents are kept in name order, which is also the order used to break
/// ties during selection.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Entry>>,
    health_timeout: Duration,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            health_timeout: Duration::from_secs(30),
        }
    }

    /// Heartbeat age after which [`check_health`](Self::check_health) marks
    /// an agent inactive.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Register directory metadata without an execution handle.
    pub fn register(&self, info: AgentInfo) -> Result<()> {
        self.insert(info, None)
    }

    /// Register an agent together with the handle used to run its steps.
    pub fn register_agent(&self, info: AgentInfo, handle: Arc<dyn Agent>) -> Result<()> {
        self.insert(info, Some(handle))
    }

    /// Register config-declared agents, each backed by `make`.
    pub fn register_entries<F>(&self, entries: &[AgentEntry], make: F) -> Result<()>
    where
        F: Fn(&AgentEntry) -> Arc<dyn Agent>,
    {
        for entry in entries {
            let mut info = AgentInfo::new(&entry.name, &entry.kind)
                .with_capabilities(entry.capabilities.iter().cloned());
            info.endpoint = entry.endpoint.clone();
            self.register_agent(info, make(entry))?;
        }
        Ok(())
    }

    fn insert(&self, mut info: AgentInfo, handle: Option<Arc<dyn Agent>>) -> Result<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&info.name) {
            return Err(WeaveError::AgentAlreadyRegistered(info.name));
        }
        let now = Utc::now();
        info.status = AgentStatus::Active;
        info.registered_at = now;
        info.last_heartbeat = now;
        info!(agent = %info.name, capabilities = info.capabilities.len(), "Agent registered");
        agents.insert(info.name.clone(), Entry { info, handle });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<AgentInfo> {
        let removed = self
            .agents
            .write()
            .remove(name)
            .ok_or_else(|| WeaveError::AgentNotFound(name.to_string()))?;
        info!(agent = %name, "Agent unregistered");
        Ok(removed.info)
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents.read().values().map(|e| e.info.clone()).collect()
    }

    pub fn list_by_capability(&self, capability: &str) -> Vec<AgentInfo> {
        self.agents
            .read()
            .values()
            .filter(|e| e.info.capabilities.contains(capability))
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn active_agents(&self) -> Vec<AgentInfo> {
        self.agents
            .read()
            .values()
            .filter(|e| e.info.status == AgentStatus::Active)
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn heartbeat(&self, name: &str) -> Result<()> {
        let mut agents = self.agents.write();
        let entry = agents
            .get_mut(name)
            .ok_or_else(|| WeaveError::AgentNotFound(name.to_string()))?;
        entry.info.last_heartbeat = Utc::now();
        if entry.info.status == AgentStatus::Inactive {
            entry.info.status = AgentStatus::Active;
            debug!(agent = %name, "Agent back from inactive");
        }
        Ok(())
    }

    /// Mark agents whose last heartbeat is older than the health timeout as
    /// inactive. Returns the names that changed.
    pub fn check_health(&self) -> Vec<String> {
        let max_age = chrono::Duration::from_std(self.health_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - max_age;
        let mut changed = Vec::new();
        for entry in self.agents.write().values_mut() {
            if entry.info.status != AgentStatus::Inactive && entry.info.last_heartbeat < cutoff {
                entry.info.status = AgentStatus::Inactive;
                warn!(agent = %entry.info.name, "Agent missed heartbeat, marked inactive");
                changed.push(entry.info.name.clone());
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDirectory for AgentRegistry {
    fn get(&self, name: &str) -> Result<AgentInfo> {
        self.agents
            .read()
            .get(name)
            .map(|e| e.info.clone())
            .ok_or_else(|| WeaveError::AgentNotFound(name.to_string()))
    }

    /// Highest capability overlap wins; the first agent in name order keeps
    /// a tie. With no required capabilities any active agent qualifies.
    fn find_best_agent(&self, capabilities: &[String]) -> Result<AgentInfo> {
        if capabilities.is_empty() {
            return self.idle_agent();
        }
        let agents = self.agents.read();
        let mut best: Option<(&AgentInfo, usize)> = None;
        for entry in agents.values() {
            if entry.info.status != AgentStatus::Active {
                continue;
            }
            let score = entry.info.overlap(capabilities);
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((&entry.info, score));
            }
        }
        best.map(|(info, _)| info.clone())
            .ok_or(WeaveError::NoAgentAvailable)
    }

    fn idle_agent(&self) -> Result<AgentInfo> {
        self.agents
            .read()
            .values()
            .find(|e| e.info.status == AgentStatus::Active)
            .map(|e| e.info.clone())
            .ok_or(WeaveError::NoAgentAvailable)
    }

    fn update_status(&self, name: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write();
        let entry = agents
            .get_mut(name)
            .ok_or_else(|| WeaveError::AgentNotFound(name.to_string()))?;
        debug!(agent = %name, from = %entry.info.status, to = %status, "Agent status changed");
        entry.info.status = status;
        Ok(())
    }

    fn handle(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(name).and_then(|e| e.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_test_utils::MockAgent;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> AgentRegistry {
        let reg = AgentRegistry::new();
        reg.register(AgentInfo::new("alpha", "worker").with_capabilities(["csv"]))
            .unwrap();
        reg.register(AgentInfo::new("beta", "worker").with_capabilities(["csv", "stats"]))
            .unwrap();
        reg.register(AgentInfo::new("gamma", "worker").with_capabilities(["http"]))
            .unwrap();
        reg
    }

    #[test]
    fn test_duplicate_registration() {
        let reg = registry();
        let err = reg.register(AgentInfo::new("alpha", "worker")).unwrap_err();
        assert!(matches!(err, WeaveError::AgentAlreadyRegistered(n) if n == "alpha"));
    }

    #[test]
    fn test_best_agent_by_overlap() {
        let reg = registry();
        assert_eq!(reg.find_best_agent(&caps(&["csv", "stats"])).unwrap().name, "beta");
        // Tie on one capability keeps the first in name order.
        assert_eq!(reg.find_best_agent(&caps(&["csv"])).unwrap().name, "alpha");
        assert!(matches!(
            reg.find_best_agent(&caps(&["gpu"])),
            Err(WeaveError::NoAgentAvailable)
        ));
    }

    #[test]
    fn test_selection_skips_busy_agents() {
        let reg = registry();
        reg.update_status("beta", AgentStatus::Busy).unwrap();
        assert_eq!(reg.find_best_agent(&caps(&["csv", "stats"])).unwrap().name, "alpha");

        reg.update_status("alpha", AgentStatus::Busy).unwrap();
        assert_eq!(reg.idle_agent().unwrap().name, "gamma");
        assert_eq!(reg.find_best_agent(&[]).unwrap().name, "gamma");

        reg.update_status("gamma", AgentStatus::Inactive).unwrap();
        assert!(matches!(reg.idle_agent(), Err(WeaveError::NoAgentAvailable)));
    }

    #[test]
    fn test_lookup_and_listing() {
        let reg = registry();
        assert_eq!(reg.list_by_capability("csv").len(), 2);
        assert_eq!(reg.active_agents().len(), 3);
        assert!(matches!(reg.get("nobody"), Err(WeaveError::AgentNotFound(_))));
        reg.unregister("gamma").unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.unregister("gamma").is_err());
    }

    #[test]
    fn test_health_check_marks_stale_agents() {
        let reg = AgentRegistry::new().with_health_timeout(Duration::ZERO);
        reg.register(AgentInfo::new("a", "worker")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(reg.check_health(), vec!["a".to_string()]);
        assert_eq!(reg.get("a").unwrap().status, AgentStatus::Inactive);
        assert!(reg.check_health().is_empty());

        reg.heartbeat("a").unwrap();
        assert_eq!(reg.get("a").unwrap().status, AgentStatus::Active);
    }

    #[test]
    fn test_handles_only_for_executable_agents() {
        let reg = registry();
        assert!(reg.handle("alpha").is_none());
        reg.register_agent(AgentInfo::new("runner", "worker"), Arc::new(MockAgent::echo("runner")))
            .unwrap();
        assert_eq!(reg.handle("runner").unwrap().name(), "runner");
    }

    #[test]
    fn test_register_entries_from_config() {
        let reg = AgentRegistry::new();
        let entries = vec![AgentEntry {
            name: "cfg".into(),
            kind: "worker".into(),
            capabilities: vec!["csv".into()],
            endpoint: Some("local".into()),
        }];
        reg.register_entries(&entries, |e| Arc::new(MockAgent::echo(&e.name)) as Arc<dyn Agent>)
            .unwrap();
        let info = reg.get("cfg").unwrap();
        assert!(info.capabilities.contains("csv"));
        assert_eq!(info.endpoint.as_deref(), Some("local"));
    }
}
