// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collaborators used by the daemon.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{AlertSurface, ContactNotifier, LocationProvider};
use crate::state::{Coordinates, EmergencySession};

/// Reports a configured or last-set fixed position.
pub struct StaticLocationProvider {
    position: Mutex<Option<Coordinates>>,
}

impl StaticLocationProvider {
    pub fn new(position: Option<Coordinates>) -> Self {
        Self {
            position: Mutex::new(position),
        }
    }

    /// Replace the reported position.
    pub fn set_position(&self, position: Option<Coordinates>) {
        *self.position.lock() = position;
    }
}

impl LocationProvider for StaticLocationProvider {
    fn current_location(&self) -> BoxFuture<'_, Result<Coordinates>> {
        let position = *self.position.lock();
        async move { position.ok_or_else(|| anyhow!("no location fix available")) }.boxed()
    }
}

/// Hands the alert to an external program, `<cmd> <phone> <message>`.
///
/// Without a program configured the message is only logged.
pub struct CommandNotifier {
    program: Option<String>,
}

impl CommandNotifier {
    pub fn new(program: Option<String>) -> Self {
        Self { program }
    }
}

impl ContactNotifier for CommandNotifier {
    fn notify_contact(&self, phone: &str, message: &str) -> Result<()> {
        let Some(program) = &self.program else {
            warn!("No notify command configured, alert for {} only logged", phone);
            info!("Alert message:\n{}", message);
            return Ok(());
        };

        let mut child = tokio::process::Command::new(program)
            .arg(phone)
            .arg(message)
            .kill_on_drop(false)
            .spawn()?;
        info!("Notifying {} via {}", phone, program);

        let phone = phone.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!("Alert delivered to {}", phone),
                Ok(status) => warn!("Notify command for {} exited with {}", phone, status),
                Err(e) => error!("Notify command for {} failed: {}", phone, e),
            }
        });
        Ok(())
    }
}

/// Prints the alert state to the log.
#[derive(Default)]
pub struct ConsoleSurface;

impl AlertSurface for ConsoleSurface {
    fn show(&self, session: &EmergencySession) -> Result<()> {
        let started = session
            .started_at
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "now".to_string());
        warn!("EMERGENCY ACTIVE since {}", started);
        Ok(())
    }

    fn hide(&self) -> Result<()> {
        info!("Emergency alert dismissed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticLocationProvider::new(None);
        assert!(provider.current_location().await.is_err());

        provider.set_position(Some(Coordinates::new(12.9, 77.6)));
        let fix = provider.current_location().await.unwrap();
        assert_eq!(fix, Coordinates::new(12.9, 77.6));
    }

    #[tokio::test]
    async fn test_notifier_without_program_logs_only() {
        let notifier = CommandNotifier::new(None);
        assert!(notifier.notify_contact("9876543210", "help").is_ok());
    }

    #[tokio::test]
    async fn test_notifier_missing_program_fails() {
        let notifier = CommandNotifier::new(Some("/nonexistent/sms-sender".to_string()));
        assert!(notifier.notify_contact("9876543210", "help").is_err());
    }
}
