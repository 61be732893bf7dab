//! Scripted capability for deterministic tests.

use async_trait::async_trait;
use relay_proto::{Capability, CapabilityError, CapabilityOutput};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted answer.
///
/// In YAML a step is written as `{ fail: "reason" }` or
/// `{ content: ..., route: Name }`. A step without `content` echoes the
/// payload it received.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub fail: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub route: Option<String>,
}

impl ScriptStep {
    pub fn reply(content: impl Into<Value>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn echo_to(route: impl Into<String>) -> Self {
        Self {
            route: Some(route.into()),
            ..Self::default()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            fail: Some(reason.into()),
            ..Self::default()
        }
    }

    fn answer(&self, payload: &Value) -> Result<CapabilityOutput, CapabilityError> {
        if let Some(reason) = &self.fail {
            return Err(CapabilityError::new(reason.clone()));
        }
        let content = self.content.clone().unwrap_or_else(|| payload.clone());
        let output = CapabilityOutput::new(content);
        Ok(match &self.route {
            Some(route) => output.route_to(route.clone()),
            None => output,
        })
    }
}

/// A capability that answers from a script and records its calls.
///
/// Steps are consumed in order; once the script runs out the last step
/// repeats. An empty script echoes every payload.
#[derive(Debug, Default)]
pub struct ScriptedCapability {
    script: Vec<ScriptStep>,
    delay: Option<Duration>,
    invocations: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
}

impl ScriptedCapability {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn always_succeed(content: impl Into<Value>) -> Self {
        Self::new(vec![ScriptStep::reply(content)])
    }

    pub fn always_fail(reason: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::fail(reason)])
    }

    /// Fails `attempt - 1` times, then succeeds with `content`.
    pub fn succeed_on(attempt: usize, content: impl Into<Value>) -> Self {
        let mut script = vec![ScriptStep::fail("not yet"); attempt.saturating_sub(1)];
        script.push(ScriptStep::reply(content));
        Self::new(script)
    }

    /// Echoes the payload and routes it to `receiver`.
    pub fn routing_to(receiver: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::echo_to(receiver)])
    }

    /// Sleeps for `delay` before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns how many times `execute` was entered.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Returns every payload received, in call order.
    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn execute(&self, payload: &Value) -> Result<CapabilityOutput, CapabilityError> {
        let call = self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(payload.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.script.get(call).or_else(|| self.script.last()) {
            Some(step) => step.answer(payload),
            None => Ok(CapabilityOutput::new(payload.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_script_then_repeat_last() {
        let cap = ScriptedCapability::new(vec![
            ScriptStep::fail("warming up"),
            ScriptStep::reply("ready"),
        ]);

        assert_eq!(
            cap.execute(&json!("a")).await.unwrap_err().reason(),
            "warming up"
        );
        assert_eq!(cap.execute(&json!("b")).await.unwrap().content, json!("ready"));
        assert_eq!(cap.execute(&json!("c")).await.unwrap().content, json!("ready"));
        assert_eq!(cap.invocations(), 3);
        assert_eq!(cap.payloads(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_empty_script_echoes() {
        let cap = ScriptedCapability::default();
        let output = cap.execute(&json!({"k": 1})).await.unwrap();
        assert_eq!(output.content, json!({"k": 1}));
        assert!(output.route.is_none());
    }

    #[tokio::test]
    async fn test_succeed_on_first_attempt() {
        let cap = ScriptedCapability::succeed_on(1, "now");
        assert!(cap.execute(&Value::Null).await.is_ok());
    }

    #[test]
    fn test_steps_from_yaml() {
        let yaml = r#"
- fail: "flaky"
- route: Review
- content: { summary: "ok" }
  route: Final
"#;
        let steps: Vec<ScriptStep> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps[0], ScriptStep::fail("flaky"));
        assert_eq!(steps[1], ScriptStep::echo_to("Review"));
        assert_eq!(steps[2].content, Some(json!({"summary": "ok"})));
        assert_eq!(steps[2].route.as_deref(), Some("Final"));
    }
}
