pub mod discofeed;
pub mod metadata;
