use serde_json::Value;
use std::fmt;

/// Snapshot from `/servers/{id}/stats`. Missing or oddly typed fields fall back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStats {
    pub server_id: String,
    pub server_name: String,
    pub running: bool,
    pub cpu: f64,
    pub memory: String,
    pub mem_percent: f64,
    pub online_players: i64,
    pub max_players: i64,
    pub version: String,
    pub world_name: String,
    pub world_size: String,
    pub started: String,
    pub crashed: bool,
    pub updating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Crashed,
    Updating,
    Running,
    Stopped,
}

impl ServerState {
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Crashed => "💥",
            Self::Updating => "🔄",
            Self::Running => "🟢",
            Self::Stopped => "🔴",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crashed => write!(f, "Crashed"),
            Self::Updating => write!(f, "Updating"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

fn text(data: &Value, key: &str, default: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

fn float(data: &Value, key: &str) -> f64 {
    match data.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn int(data: &Value, key: &str) -> i64 {
    match data.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn flag(data: &Value, key: &str) -> bool {
    match data.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}

impl ServerStats {
    pub fn from_value(server_id: &str, data: &Value) -> Self {
        let server_name = data
            .get("server_id")
            .and_then(|info| info.get("server_name"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        Self {
            server_id: server_id.to_string(),
            server_name,
            running: flag(data, "running"),
            cpu: float(data, "cpu"),
            memory: text(data, "mem", "0MB"),
            mem_percent: float(data, "mem_percent"),
            online_players: int(data, "online"),
            max_players: int(data, "max"),
            version: text(data, "version", "Unknown"),
            world_name: text(data, "world_name", "Unknown"),
            world_size: text(data, "world_size", "0MB"),
            started: text(data, "started", "Unknown"),
            crashed: flag(data, "crashed"),
            updating: flag(data, "updating"),
        }
    }

    pub fn state(&self) -> ServerState {
        if self.crashed {
            ServerState::Crashed
        } else if self.updating {
            ServerState::Updating
        } else if self.running {
            ServerState::Running
        } else {
            ServerState::Stopped
        }
    }

    pub fn players(&self) -> String {
        format!("{}/{}", self.online_players, self.max_players)
    }

    /// Multi-line summary used by `/status`.
    pub fn summary(&self) -> String {
        let state = self.state();
        let mut lines = vec![
            format!("📊 **Server Status: {}**", self.server_name),
            format!("• Status: {} {}", state.emoji(), state),
            format!("• Server ID: `{}`", self.server_id),
            format!("• Version: {}", self.version),
            format!("• CPU Usage: {:.1}%", self.cpu),
            format!("• Memory Usage: {} ({:.1}%)", self.memory, self.mem_percent),
            format!("• Players Online: {}", self.players()),
        ];

        if self.world_name != "Unknown" {
            lines.push(format!("• World Name: {}", self.world_name));
        }
        if self.world_size != "0MB" {
            lines.push(format!("• World Size: {}", self.world_size));
        }
        if self.running && self.started != "Unknown" {
            lines.push(format!("• Started: {}", self.started));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_parsing() {
        let stats = ServerStats::from_value(
            "abc",
            &json!({
                "running": 1,
                "cpu": "7.25",
                "mem_percent": null,
                "online": "4",
                "max": 10.0,
                "crashed": "false",
                "world_size": "2.1GB"
            }),
        );

        assert_eq!(stats.server_name, "Unknown");
        assert!(stats.running);
        assert_eq!(stats.cpu, 7.25);
        assert_eq!(stats.mem_percent, 0.0);
        assert_eq!(stats.players(), "4/10");
        assert_eq!(stats.memory, "0MB");
        assert_eq!(stats.state(), ServerState::Running);
    }

    #[test]
    fn crashed_wins_over_running() {
        let stats = ServerStats::from_value(
            "abc",
            &json!({ "running": true, "crashed": true, "updating": true }),
        );
        assert_eq!(stats.state(), ServerState::Crashed);
    }

    #[test]
    fn summary_skips_placeholder_fields() {
        let stats = ServerStats::from_value("abc", &json!({ "running": false }));
        let summary = stats.summary();
        assert!(summary.contains("🔴 Stopped"));
        assert!(!summary.contains("World Size"));
        assert!(!summary.contains("World Name"));
        assert!(!summary.contains("Started"));
    }
}
