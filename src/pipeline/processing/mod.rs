// Pipeline processing: matching, classification, taxonomy, duplicates and quality

pub mod benchmark;
pub mod classifier;
pub mod duplicates;
pub mod normalize;
pub mod quality;
pub mod similarity;
pub mod taxonomy;
