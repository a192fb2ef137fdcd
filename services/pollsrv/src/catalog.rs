//! Device model catalog
//!
//! Register schemas are compiled once per model at startup; devices of the
//! same model share the compiled blocks.

use std::collections::HashMap;
use std::sync::Arc;

use meter_protocols::{load_schema_csv, DeviceEndpoint, RegisterBlock, RegisterMap, TransformTable};
use tracing::info;

use crate::config::{DeviceConfig, ModelConfig};
use crate::error::{PollSrvError, Result};

/// Compiled register blocks and transforms of one model
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub instant: Arc<Vec<RegisterBlock>>,
    pub cumulative: Arc<Vec<RegisterBlock>>,
    pub transforms: Arc<TransformTable>,
}

impl CompiledModel {
    pub fn new(map: RegisterMap, transforms: TransformTable) -> Self {
        Self {
            instant: Arc::new(map.instant),
            cumulative: Arc::new(map.cumulative),
            transforms: Arc::new(transforms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, CompiledModel>,
}

impl ModelCatalog {
    /// Load and compile every model's schema file
    pub fn load(models: &[ModelConfig], max_block_size: u16) -> Result<Self> {
        let mut catalog = Self::default();
        for model in models {
            let rows = load_schema_csv(&model.schema_path)?;
            let map = RegisterMap::compile(&rows, max_block_size)?;
            info!(
                "Model '{}': {} instant blocks, {} cumulative blocks",
                model.name,
                map.instant.len(),
                map.cumulative.len()
            );
            catalog.insert(&model.name, CompiledModel::new(map, model.transforms.clone()));
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, name: impl Into<String>, model: CompiledModel) {
        self.models.insert(name.into(), model);
    }

    pub fn get(&self, name: &str) -> Option<&CompiledModel> {
        self.models.get(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Endpoint for a configured device, sharing its model's blocks
    pub fn endpoint(&self, device: &DeviceConfig) -> Result<DeviceEndpoint> {
        let model = self.get(&device.model).ok_or_else(|| {
            PollSrvError::config(format!(
                "device {} references unknown model '{}'",
                device.id, device.model
            ))
        })?;

        Ok(DeviceEndpoint {
            id: device.id,
            name: device.name.clone(),
            host: device.host.clone(),
            port: device.port,
            protocol: device.protocol,
            unit_id: device.unit_id,
            model: device.model.clone(),
            instant_blocks: Arc::clone(&model.instant),
            cumulative_blocks: Arc::clone(&model.cumulative),
            transforms: Arc::clone(&model.transforms),
            status: device.status,
            notes: device.notes.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use meter_protocols::{DeviceStatus, ProtocolError, ProtocolKind};

    const SCHEMA: &str = "\
address,size,type,byte_order,word_order,function,attribute,group,active
0,2,float32,,,1,voltage_l1,instant,1
2,2,float32,,,1,voltage_l2,instant,1
100,2,uint32,,,2,active_energy_import,cumulative,1
";

    fn device(id: u32, model: &str) -> DeviceConfig {
        DeviceConfig {
            id,
            name: format!("meter-{id}"),
            host: "127.0.0.1".to_string(),
            port: 1502,
            protocol: ProtocolKind::Tcp,
            unit_id: 1,
            model: model.to_string(),
            status: DeviceStatus::Active,
            notes: None,
        }
    }

    #[test]
    fn test_load_and_share_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.csv");
        std::fs::write(&path, SCHEMA).unwrap();

        let catalog = ModelCatalog::load(
            &[ModelConfig {
                name: "pm".to_string(),
                schema_path: path,
                transforms: TransformTable::new(),
            }],
            125,
        )
        .unwrap();
        assert_eq!(catalog.len(), 1);

        let a = catalog.endpoint(&device(1, "pm")).unwrap();
        let b = catalog.endpoint(&device(2, "pm")).unwrap();
        assert_eq!(a.instant_blocks.len(), 1);
        assert_eq!(a.instant_blocks[0].size, 4);
        assert_eq!(a.cumulative_blocks.len(), 1);
        assert!(Arc::ptr_eq(&a.instant_blocks, &b.instant_blocks));
        assert_eq!(b.address(), "127.0.0.1:1502");
    }

    #[test]
    fn test_unknown_model_and_missing_schema() {
        let catalog = ModelCatalog::default();
        assert!(matches!(
            catalog.endpoint(&device(1, "ghost")),
            Err(PollSrvError::Config(_))
        ));

        let err = ModelCatalog::load(
            &[ModelConfig {
                name: "pm".to_string(),
                schema_path: "/nonexistent/pm.csv".into(),
                transforms: TransformTable::new(),
            }],
            125,
        )
        .unwrap_err();
        assert!(matches!(err, PollSrvError::Protocol(ProtocolError::Schema(_))));
    }
}
