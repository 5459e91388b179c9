//! Narrow health-reporting surface.
//!
//! Components whose availability depends on external infrastructure
//! implement [`Volatile`]. A host application aggregates them through its
//! own [`VolatileRegistry`]; [`SimpleRegistry`] is a minimal in-memory one
//! used by the `status` command and tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

/// Availability of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Available,
    Limited,
    Unavailable,
}

impl HealthState {
    pub fn is_available(&self) -> bool {
        matches!(self, HealthState::Available)
    }

    /// Combines two states, keeping the worse one.
    pub fn worst(self, other: HealthState) -> HealthState {
        use HealthState::*;
        match (self, other) {
            (Unavailable, _) | (_, Unavailable) => Unavailable,
            (Limited, _) | (_, Limited) => Limited,
            _ => Available,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Available => "AVAILABLE",
            HealthState::Limited => "LIMITED",
            HealthState::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// A component with a health state.
#[async_trait]
pub trait Volatile: Send + Sync {
    /// Stable component name used in health reports.
    fn name(&self) -> &str;

    /// Current state, probing infrastructure if necessary.
    async fn state(&self) -> HealthState;
}

/// Registration point for volatile components.
#[async_trait]
pub trait VolatileRegistry: Send + Sync {
    /// Registers `component`, optionally listing the components it depends on.
    async fn register(&self, component: Arc<dyn Volatile>, depends_on: Vec<Arc<dyn Volatile>>);
}

/// Health of a component as reported by [`SimpleRegistry::report`].
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub state: HealthState,
    pub components: Vec<ComponentHealth>,
}

/// Worst state in `report`, dependencies included. An empty report is available.
pub fn overall_state(report: &[ComponentHealth]) -> HealthState {
    report.iter().fold(HealthState::Available, |state, component| {
        state
            .worst(component.state)
            .worst(overall_state(&component.components))
    })
}

struct Registration {
    component: Arc<dyn Volatile>,
    depends_on: Vec<Arc<dyn Volatile>>,
}

/// In-memory [`VolatileRegistry`].
#[derive(Default)]
pub struct SimpleRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl SimpleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes every registered component and its dependencies.
    pub async fn report(&self) -> Vec<ComponentHealth> {
        let registrations = self.registrations.read().await;
        let mut report = Vec::with_capacity(registrations.len());

        for registration in registrations.iter() {
            let mut components = Vec::with_capacity(registration.depends_on.len());
            for dependency in &registration.depends_on {
                components.push(ComponentHealth {
                    name: dependency.name().to_string(),
                    state: dependency.state().await,
                    components: Vec::new(),
                });
            }
            report.push(ComponentHealth {
                name: registration.component.name().to_string(),
                state: registration.component.state().await,
                components,
            });
        }

        report
    }
}

#[async_trait]
impl VolatileRegistry for SimpleRegistry {
    async fn register(&self, component: Arc<dyn Volatile>, depends_on: Vec<Arc<dyn Volatile>>) {
        self.registrations.write().await.push(Registration {
            component,
            depends_on,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, HealthState);

    #[async_trait]
    impl Volatile for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn state(&self) -> HealthState {
            self.1
        }
    }

    #[test]
    fn test_worst_state() {
        assert_eq!(
            HealthState::Available.worst(HealthState::Limited),
            HealthState::Limited
        );
        assert_eq!(
            HealthState::Limited.worst(HealthState::Unavailable),
            HealthState::Unavailable
        );
        assert_eq!(
            HealthState::Available.worst(HealthState::Available),
            HealthState::Available
        );
    }

    #[tokio::test]
    async fn test_overall_state_includes_dependencies() {
        let registry = SimpleRegistry::new();
        registry
            .register(
                Arc::new(Fixed("jobs", HealthState::Available)),
                vec![Arc::new(Fixed("redis", HealthState::Limited)) as Arc<dyn Volatile>],
            )
            .await;
        registry
            .register(Arc::new(Fixed("cache", HealthState::Available)), Vec::new())
            .await;

        let report = registry.report().await;
        assert_eq!(overall_state(&report), HealthState::Limited);
        assert_eq!(overall_state(&report[1..]), HealthState::Available);
        assert_eq!(overall_state(&[]), HealthState::Available);
    }

    #[tokio::test]
    async fn test_simple_registry_report() {
        let registry = SimpleRegistry::new();
        registry
            .register(
                Arc::new(Fixed("jobs", HealthState::Unavailable)),
                vec![Arc::new(Fixed("redis", HealthState::Unavailable)) as Arc<dyn Volatile>],
            )
            .await;

        let report = registry.report().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].name, "jobs");
        assert_eq!(report[0].state, HealthState::Unavailable);
        assert_eq!(report[0].components[0].name, "redis");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(HealthState::Available.to_string(), "AVAILABLE");
    }
}
