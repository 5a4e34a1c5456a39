//! Telemetry projection into the state tree.

use std::sync::Arc;

use carlink_proto::{Attribute, TelemetryBatch};

use crate::history::Metric;
use crate::tree::{StateTree, TreeError, WriteMeta};

/// A republished level fact the history tracker cares about.
#[derive(Debug, Clone)]
pub struct LevelTick {
    pub vin: String,
    pub metric: Metric,
    pub value: i64,
}

/// Publishes decoded telemetry batches as individual `{vin}.state.{attr}.{field}`
/// facts, unconditionally. Downstream consumers detect no-ops themselves.
pub struct StateProjector {
    tree: Arc<dyn StateTree>,
}

impl StateProjector {
    pub fn new(tree: Arc<dyn StateTree>) -> Self {
        Self { tree }
    }

    /// Publish every attribute field of the batch. Returns the level ticks
    /// (tank level, state of charge) for history tracking.
    pub async fn project(&self, batch: &TelemetryBatch) -> Result<Vec<LevelTick>, TreeError> {
        let mut ticks = Vec::new();
        for (vin, update) in &batch.updates {
            for (name, attr) in &update.attributes {
                for (field, value) in attr.fields() {
                    let key = format!("{vin}.state.{name}.{field}");
                    let meta = self.tree.set(&key, value).await?;
                    self.mirror(vin, name, field, attr, meta).await?;
                }
                if let Some(value) = attr.int_value {
                    match name.as_str() {
                        "tanklevelpercent" => ticks.push(LevelTick {
                            vin: vin.clone(),
                            metric: Metric::Fuel,
                            value,
                        }),
                        "soc" => ticks.push(LevelTick {
                            vin: vin.clone(),
                            metric: Metric::Charge,
                            value,
                        }),
                        _ => {}
                    }
                }
            }
        }
        Ok(ticks)
    }

    /// Convenience mirrors under `{vin}.remote.*`. A mirror fires only when
    /// the written fact is a genuine change (`ts == lc`); bulk resends must
    /// not feed back into command dispatch.
    async fn mirror(
        &self,
        vin: &str,
        name: &str,
        field: &str,
        attr: &Attribute,
        meta: WriteMeta,
    ) -> Result<(), TreeError> {
        if meta.ts != meta.lc {
            return Ok(());
        }
        match (name, field) {
            ("doorLockStatusOverall", "intValue") => {
                let v = attr.int_value.unwrap_or(0);
                self.set_remote(vin, "DoorLock", v == 0).await?;
                self.set_remote(vin, "DoorOpen", v != 0).await?;
            }
            ("windowStatusOverall", "intValue") => {
                let v = attr.int_value.unwrap_or(0);
                self.set_remote(vin, "WindowsOpen", v == 2).await?;
            }
            ("precondActive" | "precondNow", "boolValue") => {
                let v = attr.bool_value.unwrap_or(false);
                self.set_remote(vin, "Preconditioning", v).await?;
            }
            ("auxheatActive", "boolValue") => {
                let v = attr.bool_value.unwrap_or(false);
                self.set_remote(vin, "Auxheat", v).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn set_remote(&self, vin: &str, leaf: &str, value: bool) -> Result<(), TreeError> {
        self.tree
            .set(&format!("{vin}.remote.{leaf}"), value.into())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use carlink_proto::VehicleUpdate;

    use super::*;
    use crate::tree::MemoryTree;

    fn batch_with(vin: &str, name: &str, attr: Attribute) -> TelemetryBatch {
        let mut attributes = BTreeMap::new();
        attributes.insert(name.to_string(), attr);
        let mut updates = BTreeMap::new();
        updates.insert(vin.to_string(), VehicleUpdate { attributes });
        TelemetryBatch {
            sequence_number: 1,
            updates,
        }
    }

    fn setup() -> (Arc<MemoryTree>, StateProjector) {
        let tree = Arc::new(MemoryTree::new());
        let projector = StateProjector::new(tree.clone());
        (tree, projector)
    }

    #[tokio::test]
    async fn publishes_each_field_under_its_wire_name() {
        let (tree, projector) = setup();
        let batch = batch_with(
            "VIN1",
            "tanklevelpercent",
            Attribute {
                int_value: Some(55),
                changed: Some(true),
                display_value: Some("55 %".into()),
                ..Default::default()
            },
        );
        projector.project(&batch).await.unwrap();

        assert_eq!(
            tree.get("VIN1.state.tanklevelpercent.intValue").await.unwrap(),
            Some(serde_json::json!(55))
        );
        assert_eq!(
            tree.get("VIN1.state.tanklevelpercent.changed").await.unwrap(),
            Some(serde_json::json!(true))
        );
        assert_eq!(
            tree.get("VIN1.state.tanklevelpercent.displayValue").await.unwrap(),
            Some(serde_json::json!("55 %"))
        );
    }

    #[tokio::test]
    async fn reports_level_ticks_for_tracked_attributes() {
        let (_tree, projector) = setup();
        let batch = batch_with(
            "VIN1",
            "soc",
            Attribute {
                int_value: Some(80),
                ..Default::default()
            },
        );
        let ticks = projector.project(&batch).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].vin, "VIN1");
        assert_eq!(ticks[0].metric, Metric::Charge);
        assert_eq!(ticks[0].value, 80);
    }

    #[tokio::test]
    async fn untracked_attributes_produce_no_ticks() {
        let (_tree, projector) = setup();
        let batch = batch_with(
            "VIN1",
            "odo",
            Attribute {
                int_value: Some(1234),
                ..Default::default()
            },
        );
        assert!(projector.project(&batch).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn door_lock_mirrors_on_genuine_change() {
        let (tree, projector) = setup();
        let batch = batch_with(
            "VIN1",
            "doorLockStatusOverall",
            Attribute {
                int_value: Some(0),
                ..Default::default()
            },
        );
        projector.project(&batch).await.unwrap();

        assert_eq!(
            tree.get("VIN1.remote.DoorLock").await.unwrap(),
            Some(serde_json::json!(true))
        );
        assert_eq!(
            tree.get("VIN1.remote.DoorOpen").await.unwrap(),
            Some(serde_json::json!(false))
        );
    }

    #[tokio::test]
    async fn bulk_resend_does_not_mirror() {
        let (tree, projector) = setup();
        let batch = batch_with(
            "VIN1",
            "doorLockStatusOverall",
            Attribute {
                int_value: Some(0),
                ..Default::default()
            },
        );
        projector.project(&batch).await.unwrap();

        // Host-side flip of the mirror, then a backend resend of the same
        // value: the mirror must stay untouched.
        tree.set("VIN1.remote.DoorLock", serde_json::json!(false))
            .await
            .unwrap();
        projector.project(&batch).await.unwrap();

        assert_eq!(
            tree.get("VIN1.remote.DoorLock").await.unwrap(),
            Some(serde_json::json!(false))
        );
    }

    #[tokio::test]
    async fn window_and_precondition_mirrors() {
        let (tree, projector) = setup();

        let windows = batch_with(
            "VIN1",
            "windowStatusOverall",
            Attribute {
                int_value: Some(2),
                ..Default::default()
            },
        );
        projector.project(&windows).await.unwrap();
        assert_eq!(
            tree.get("VIN1.remote.WindowsOpen").await.unwrap(),
            Some(serde_json::json!(true))
        );

        let precond = batch_with(
            "VIN1",
            "precondNow",
            Attribute {
                bool_value: Some(true),
                ..Default::default()
            },
        );
        projector.project(&precond).await.unwrap();
        assert_eq!(
            tree.get("VIN1.remote.Preconditioning").await.unwrap(),
            Some(serde_json::json!(true))
        );

        let auxheat = batch_with(
            "VIN1",
            "auxheatActive",
            Attribute {
                bool_value: Some(false),
                ..Default::default()
            },
        );
        projector.project(&auxheat).await.unwrap();
        assert_eq!(
            tree.get("VIN1.remote.Auxheat").await.unwrap(),
            Some(serde_json::json!(false))
        );
    }
}
