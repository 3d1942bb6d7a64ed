//! Migration parameters (C15, §4.9): the user-facing knobs resolved by
//! `set_params` into the pipeline's internal flags.

/// Raw option set as accepted from the outer migration engine's configurator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationParams {
    pub blk: bool,
    pub shared: bool,
    pub sparse: bool,
}

impl MigrationParams {
    /// Resolves `shared`/`sparse` implying `blk`, per §4.9. The pipeline is active
    /// iff `blk_enable` is true after implications are applied.
    pub fn resolve(self) -> crate::pipeline::PipelineParams {
        let blk_enable = self.blk || self.shared || self.sparse;
        crate::pipeline::PipelineParams {
            blk_enable,
            shared_base: self.shared,
            sparse_enable: self.sparse,
        }
    }
}
