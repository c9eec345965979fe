// matching/ - Per-mention resolution stages, applied in order by the pipeline.
//
// - normalize: cleanup + skip classification
// - overrides: curated rule table
// - similarity: embedding nearest neighbour over the catalog

pub mod normalize;
pub mod overrides;
pub mod similarity;
