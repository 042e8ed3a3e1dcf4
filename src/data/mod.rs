pub mod index;
pub mod parser;
pub mod source;
pub mod store;

pub use index::IndexSpace;
pub use source::{DataSource, FileSource, MemorySource};
pub use store::{InteractionStore, LoadSummary};

use rayon::join;

use crate::error::Result;
use crate::models::{ItemMetadata, RawInteraction};

/// Fetch and parse both record files through a data source.
///
/// The two texts are parsed in parallel; per-line failures are skipped and
/// counted inside the parsers.
pub async fn fetch_records(
    source: &dyn DataSource,
    interactions_name: &str,
    items_name: &str,
) -> Result<(Vec<RawInteraction>, Vec<ItemMetadata>)> {
    let interactions_text = source.fetch(interactions_name).await?;
    let items_text = source.fetch(items_name).await?;

    let (interactions, items) = join(
        || parser::parse_interactions(interactions_name, &interactions_text),
        || parser::parse_items(items_name, &items_text),
    );
    let (interactions, _) = interactions?;
    let (items, _) = items?;
    Ok((interactions, items))
}
