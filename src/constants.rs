//! Crate wide constants.

/// Number of bits of the integer backing a space key.
pub const KEY_BITS: usize = 64;

/// Byte budget for the key samples each rank sends to the splitter root.
pub const SAMPLE_BYTES: usize = 256 * 1024;

/// Minimum number of sub-entities in a branch shared during the branch exchange.
pub const BRANCH_CRITERION: usize = 1;

/// Default support radius of the smoothing kernel in units of the smoothing length.
pub const KERNEL_WIDTH: f64 = 2.0;

/// Maximum number of times a candidate timestep is halved before giving up.
pub const MAX_TIMESTEP_HALVINGS: u32 = 20;

/// Ratio of the largest to the smallest local particle count that triggers a full re-sort.
pub const RESORT_THRESHOLD: f64 = 1.5;

/// Tag used for the point to point messages of the hypercube exchange.
pub const HYPERCUBE_TAG: i32 = 1;

/// Number of children of a branch in `D` dimensions.
pub const fn fan_out(dim: usize) -> usize {
    1 << dim
}
