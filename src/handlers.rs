use crate::{
    auth::{AuthUser, MaybeAuthUser},
    errors::AppError,
    feed::{FeedQuery, PageQuery},
    models::{MemePatch, VoteType},
    service::{ImageUpload, MemeDraft},
    validation, AppState,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub vote_type: String,
}

#[derive(Deserialize, Debug)]
pub struct FlagRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewCommentRequest {
    pub meme_id: String,
    pub text: String,
}

fn parse_form_value<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::InvalidInput(format!("Invalid value for '{}': '{}'", field, raw)))
}

/// POST /api/memes (multipart form)
pub async fn create_meme(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut image: Option<ImageUpload> = None;
    let mut draft = MemeDraft::default();

    while let Some(field) = multipart.next_field().await? {
        let field_name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        match field_name.as_str() {
            "image" => {
                let file_name = field.file_name().map(|s| s.to_string());
                let content_type = field.content_type().map(|m| m.to_string());
                image = Some(ImageUpload {
                    data: field.bytes().await?.to_vec(),
                    file_name,
                    content_type,
                });
            }
            "topText" => draft.top_text = Some(field.text().await?),
            "bottomText" => draft.bottom_text = Some(field.text().await?),
            "tags" => draft.tags = validation::parse_tag_list(&field.text().await?),
            "fontSize" => draft.font_size = Some(parse_form_value("fontSize", &field.text().await?)?),
            "fontColor" => draft.font_color = Some(field.text().await?),
            "isDraft" => draft.is_draft = parse_form_value("isDraft", &field.text().await?)?,
            _ => tracing::debug!("Ignoring unknown multipart field: {}", field_name),
        }
    }

    let image = image.ok_or_else(|| AppError::MissingFormField("image".to_string()))?;
    let meme = state.service.create_meme(&user, image, draft).await?;
    Ok((StatusCode::CREATED, Json(meme)))
}

/// PATCH /api/memes/{id}
pub async fn update_meme(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id_str): Path<String>,
    payload: Result<Json<MemePatch>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(patch) = payload?;
    let meme_id = Uuid::parse_str(&id_str)?;
    let meme = state.service.update_meme(meme_id, &user, patch).await?;
    Ok(Json(meme))
}

/// GET /api/memes/{id}: counts as a view.
pub async fn get_meme(
    State(state): State<Arc<AppState>>,
    MaybeAuthUser(viewer): MaybeAuthUser,
    Path(id_str): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = Uuid::parse_str(&id_str)?;
    tracing::debug!(%meme_id, "Fetching meme details via handler");
    let detail = state.service.view_meme(meme_id, viewer.as_ref()).await?;
    Ok(Json(detail))
}

pub async fn list_memes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state.service.feed(&query).await?;
    tracing::debug!(total = page.total, ?query, "Feed page served");
    Ok(Json(page))
}

pub async fn trending_today(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.service.trending_today().await?))
}

pub async fn my_memes(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.service.memes_by_creator(&user.user_id).await?))
}

/// POST /api/memes/{id}/vote
pub async fn vote_meme(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id_str): Path<String>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    let meme_id = Uuid::parse_str(&id_str)?;
    let vote_type: VoteType = body
        .vote_type
        .parse()
        .map_err(|e: crate::models::UnknownVoteType| AppError::InvalidInput(e.to_string()))?;
    let outcome = state.service.cast_vote(meme_id, &user, vote_type).await?;
    Ok(Json(outcome))
}

/// POST /api/memes/{id}/flag
pub async fn flag_meme(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id_str): Path<String>,
    payload: Result<Json<FlagRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    let meme_id = Uuid::parse_str(&id_str)?;
    let outcome = state.service.flag_meme(meme_id, &user, &body.reason).await?;
    Ok(Json(outcome))
}

/// DELETE /api/memes/{id}: removes the image, the comments and the meme.
pub async fn delete_meme(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id_str): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = Uuid::parse_str(&id_str)?;
    tracing::debug!(%meme_id, "Deleting meme via handler");
    state.service.delete_meme(meme_id, &user.user_id).await?;
    Ok(Json(json!({ "message": "Meme deleted successfully" })))
}

/// GET /api/comments/meme/{memeId}
pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path(id_str): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = Uuid::parse_str(&id_str)?;
    Ok(Json(state.service.list_comments(meme_id, &query).await?))
}

/// POST /api/comments
pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    payload: Result<Json<NewCommentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    let meme_id = Uuid::parse_str(&body.meme_id)?;
    let comment = state.service.add_comment(&user, meme_id, &body.text).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// DELETE /api/comments/{id}: returns the meme's new comment count.
pub async fn delete_comment(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id_str): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let comment_id = Uuid::parse_str(&id_str)?;
    let count = state.service.remove_comment(comment_id, &user).await?;
    Ok(Json(count))
}

pub async fn creator_stats(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.service.creator_stats(&user_id).await?))
}

/// Handler for GET /images/{key}
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    tracing::debug!(image_key = %key, "Fetching image file via handler");

    let (data, content_type) = state.service.image(&key).await?;
    let content_type = content_type
        .or_else(|| mime_guess::from_path(&key).first_raw().map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(data))
        .map_err(|e| AppError::InternalServerError(format!("Failed to build image response: {}", e)))
}

pub async fn healthz() -> &'static str {
    "ok"
}
