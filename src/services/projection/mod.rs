use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::algorithms::RetrievalModel;
use crate::data::InteractionStore;
use crate::error::{RecError, Result};

/// External dimensionality-reduction capability. The core does not care how
/// the projection is computed, only about its shape.
pub trait Reducer {
    fn reduce(&self, data: &DMatrix<f32>, target_dims: usize) -> Result<DMatrix<f32>>;
}

/// One item placed on the 2D embedding map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPoint {
    pub item: usize,
    pub external_id: u32,
    pub title: String,
    pub x: f32,
    pub y: f32,
}

/// Project every item embedding to 2D and pair the points with catalog
/// metadata for display.
pub fn project_items(
    model: &dyn RetrievalModel,
    store: &InteractionStore,
    reducer: &dyn Reducer,
) -> Result<Vec<ItemPoint>> {
    if model.num_items() != store.num_items() {
        return Err(RecError::StaleModel {
            model_items: model.num_items(),
            store_items: store.num_items(),
        });
    }

    let indices: Vec<usize> = (0..store.num_items()).collect();
    let embeddings = model.embed_items(&indices)?;
    let points = reducer.reduce(&embeddings, 2)?;

    if points.nrows() != store.num_items() {
        return Err(RecError::BatchShape {
            context: "projected rows",
            left: points.nrows(),
            right: store.num_items(),
        });
    }
    if points.ncols() != 2 {
        return Err(RecError::BatchShape {
            context: "projected dims",
            left: points.ncols(),
            right: 2,
        });
    }

    indices
        .into_iter()
        .map(|item| {
            Ok(ItemPoint {
                item,
                external_id: store
                    .item_index()
                    .to_external(item)
                    .ok_or(RecError::UnknownItem(item))?,
                title: store.title(item)?.to_string(),
                x: points[(item, 0)],
                y: points[(item, 1)],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::TwoTowerModel;
    use crate::models::{ItemMetadata, RawInteraction, GENRE_DIM};

    struct FirstTwoColumns;

    impl Reducer for FirstTwoColumns {
        fn reduce(&self, data: &DMatrix<f32>, target_dims: usize) -> Result<DMatrix<f32>> {
            Ok(DMatrix::from_fn(data.nrows(), target_dims, |r, c| {
                data[(r, c)]
            }))
        }
    }

    struct WrongShape;

    impl Reducer for WrongShape {
        fn reduce(&self, data: &DMatrix<f32>, _target_dims: usize) -> Result<DMatrix<f32>> {
            Ok(DMatrix::zeros(data.nrows(), 3))
        }
    }

    fn small_store() -> InteractionStore {
        let interactions = vec![
            RawInteraction { user_id: 1, item_id: 10, rating: 5, timestamp: 1 },
            RawInteraction { user_id: 1, item_id: 20, rating: 4, timestamp: 2 },
        ];
        let items = vec![
            ItemMetadata {
                item_id: 10,
                title: "First".to_string(),
                release_year: None,
                genres: [0; GENRE_DIM],
            },
            ItemMetadata {
                item_id: 20,
                title: "Second".to_string(),
                release_year: None,
                genres: [0; GENRE_DIM],
            },
        ];
        InteractionStore::load(interactions, items, None, 1).unwrap()
    }

    #[test]
    fn test_points_carry_catalog_metadata() {
        let store = small_store();
        let model = TwoTowerModel::new(1, 2, 4, 1);
        let points = project_items(&model, &store, &FirstTwoColumns).unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].external_id, 10);
        assert_eq!(points[0].title, "First");
        assert_eq!(points[1].external_id, 20);
    }

    #[test]
    fn test_bad_reducer_shape_rejected() {
        let store = small_store();
        let model = TwoTowerModel::new(1, 2, 4, 1);
        let err = project_items(&model, &store, &WrongShape).unwrap_err();
        assert!(matches!(err, RecError::BatchShape { .. }));
    }

    #[test]
    fn test_stale_model_rejected() {
        let store = small_store();
        let model = TwoTowerModel::new(1, 5, 4, 1);
        let err = project_items(&model, &store, &FirstTwoColumns).unwrap_err();
        assert!(matches!(err, RecError::StaleModel { .. }));
    }
}
