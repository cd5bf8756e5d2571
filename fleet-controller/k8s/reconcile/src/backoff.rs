use fleet_controller_core::RetryPolicy;
use fleet_controller_k8s_api::is_conflict;
use tokio::time;

pub(crate) struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 1 }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sleeps and returns true if `error` is a conflict and the policy allows
    /// another try.
    pub(crate) async fn retry(&mut self, error: &kube::Error) -> bool {
        if !is_conflict(error) || !self.policy.allows_retry(self.attempt) {
            return false;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        true
    }
}
