use crate::{
    entities::{movie, Movie, MovieModel},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Read-mostly movie catalog: the authoritative source for price and
/// availability. The order engine re-reads it at checkout time and never
/// trusts client-supplied prices.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

/// Input for stocking the catalog
#[derive(Debug, Deserialize, Validate)]
pub struct CreateMovieInput {
    #[validate(length(min = 1, max = 255, message = "Title is required"))]
    pub title: String,
    pub description: Option<String>,
    pub price: Decimal,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Looks up a movie by id; `NotFound` when the id is unknown.
    pub async fn get_movie(&self, movie_id: Uuid) -> Result<MovieModel, ServiceError> {
        Movie::find_by_id(movie_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Movie {} not found", movie_id)))
    }

    /// Lists available movies, newest first.
    pub async fn list_movies(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<MovieModel>, u64), ServiceError> {
        let paginator = Movie::find()
            .filter(movie::Column::Available.eq(true))
            .order_by_desc(movie::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let data = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((data, total))
    }

    /// Adds a movie to the catalog.
    #[instrument(skip(self, input), fields(title = %input.title))]
    pub async fn create_movie(&self, input: CreateMovieInput) -> Result<MovieModel, ServiceError> {
        input.validate()?;

        if input.price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Price must not be negative".to_string(),
            ));
        }

        let movie_id = Uuid::new_v4();
        let now = Utc::now();
        let movie = movie::ActiveModel {
            id: Set(movie_id),
            title: Set(input.title),
            description: Set(input.description),
            price: Set(input.price),
            available: Set(input.available),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let movie = movie.insert(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::MovieCreated(movie_id))
            .await;

        info!("Created movie: {}", movie_id);
        Ok(movie)
    }

    /// Flips a movie's availability; unavailable movies cannot be added to
    /// carts or checked out.
    #[instrument(skip(self))]
    pub async fn set_availability(
        &self,
        movie_id: Uuid,
        available: bool,
    ) -> Result<MovieModel, ServiceError> {
        let movie = self.get_movie(movie_id).await?;

        let mut active: movie::ActiveModel = movie.into();
        active.available = Set(available);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::MovieAvailabilityChanged {
                movie_id,
                available,
            })
            .await;

        Ok(updated)
    }
}
