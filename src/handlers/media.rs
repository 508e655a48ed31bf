use anyhow::{anyhow, Result};
use teloxide::prelude::*;
use teloxide::types::FileId;

use crate::config::CONFIG;
use crate::llm::{download_media, InlineImage};
use crate::session::ImageHandle;

const IMAGE_FILE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".webp", ".heic"];

pub async fn get_file_url(bot: &Bot, file_id: &FileId) -> Result<String> {
    let file = bot.get_file(file_id.clone()).await?;
    Ok(format!(
        "https://api.telegram.org/file/bot{}/{}",
        CONFIG.bot_token, file.path
    ))
}

fn is_image_file_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    IMAGE_FILE_EXTENSIONS
        .iter()
        .any(|extension| lower.ends_with(extension))
}

/// File id of the image a message carries: the largest photo size, or a
/// document sent "as file" that is an image.
pub fn message_image_file(message: &Message) -> Option<FileId> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(photo.file.id.clone());
    }

    let document = message.document()?;
    let mime_is_image = document
        .mime_type
        .as_ref()
        .map(|mime| mime.essence_str().starts_with("image/"))
        .unwrap_or(false);
    let name_is_image = document
        .file_name
        .as_deref()
        .map(is_image_file_name)
        .unwrap_or(false);
    if mime_is_image || name_is_image {
        Some(document.file.id.clone())
    } else {
        None
    }
}

pub fn image_handle(file_id: &FileId) -> ImageHandle {
    ImageHandle(file_id.0.clone())
}

pub async fn fetch_image(bot: &Bot, handle: &ImageHandle) -> Result<InlineImage> {
    let url = get_file_url(bot, &FileId(handle.0.clone())).await?;
    let bytes = download_media(&url)
        .await
        .map_err(|err| anyhow!("Failed to download image: {err}"))?;
    Ok(InlineImage::from_bytes(bytes)?)
}
