/// Kind → factory mapping used when a pipeline is built from a graph

use std::collections::BTreeMap;

use super::alignment::FreqPhaseAlignment;
use super::apodization::{LineBroadening, ZeroPadding};
use super::averaging::{Average, BlockAverage, MovingAverage, SnrWeightedAverage};
use super::bad_averages::RemoveBadAverages;
use super::coil_combination::CoilCombination;
use super::eddy_current::EddyCurrentCorrection;
use super::external::{ExternalStep, PluginSpec};
use super::quality::QualityMatrix;
use super::te_phase::TePhaseCorrection;
use super::{Step, StepKind};

pub type StepFactory = Box<dyn Fn() -> Box<dyn Step> + Send + Sync>;

/// Registered step kinds, keyed by their name
pub struct StepRegistry {
    factories: BTreeMap<String, StepFactory>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry populated with every built-in step
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(StepKind::CoilCombination, || Box::new(CoilCombination::default()));
        registry.register(StepKind::EddyCurrentCorrection, || {
            Box::new(EddyCurrentCorrection::default())
        });
        registry.register(StepKind::FreqPhaseAlignment, || Box::new(FreqPhaseAlignment::default()));
        registry.register(StepKind::TePhaseCorrection, || Box::new(TePhaseCorrection::default()));
        registry.register(StepKind::RemoveBadAverages, || Box::new(RemoveBadAverages::default()));
        registry.register(StepKind::Average, || Box::new(Average::default()));
        registry.register(StepKind::BlockAverage, || Box::new(BlockAverage::default()));
        registry.register(StepKind::SnrWeightedAverage, || Box::new(SnrWeightedAverage::default()));
        registry.register(StepKind::MovingAverage, || Box::new(MovingAverage::default()));
        registry.register(StepKind::LineBroadening, || Box::new(LineBroadening::default()));
        registry.register(StepKind::ZeroPadding, || Box::new(ZeroPadding::default()));
        registry.register(StepKind::QualityMatrix, || Box::new(QualityMatrix::default()));
        registry
    }

    pub fn register<F>(&mut self, kind: StepKind, factory: F)
    where
        F: Fn() -> Box<dyn Step> + Send + Sync + 'static,
    {
        let name = kind.as_str().to_string();
        if self.factories.insert(name.clone(), Box::new(factory)).is_some() {
            log::warn!("Step kind {} registered twice, keeping the latest", name);
        }
    }

    /// Register a subprocess plugin
    pub fn register_plugin(&mut self, spec: PluginSpec) {
        let kind = StepKind::External(spec.kind.clone());
        log::info!("Registering plugin step {} ({})", spec.kind, spec.command);
        self.register(kind, move || Box::new(ExternalStep::new(spec.clone())));
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Step>> {
        self.factories.get(kind).map(|f| f())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|k| k.as_str())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_registered() {
        let registry = StepRegistry::with_builtin();
        for kind in StepKind::BUILTIN.iter() {
            let step = registry.create(kind.as_str()).unwrap();
            assert_eq!(&step.kind(), kind);
        }
        assert!(registry.create("NoSuchStep").is_none());
    }

    #[test]
    fn test_plugin_registration() {
        let mut registry = StepRegistry::with_builtin();
        registry.register_plugin(PluginSpec {
            kind: "Denoise".to_string(),
            command: "denoise".to_string(),
            args: Vec::new(),
            parameters: Default::default(),
        });
        assert!(registry.contains("Denoise"));
        assert_eq!(
            registry.create("Denoise").unwrap().kind(),
            StepKind::External("Denoise".to_string())
        );
    }

    #[test]
    fn test_factories_produce_fresh_steps() {
        use crate::steps::parameter::ParameterValue;
        let registry = StepRegistry::with_builtin();
        let mut a = registry.create("ZeroPadding").unwrap();
        a.set_parameter("factor", ParameterValue::Integer(3)).unwrap();
        let b = registry.create("ZeroPadding").unwrap();
        assert_eq!(b.parameters().get_int("factor").unwrap(), 1);
    }
}
