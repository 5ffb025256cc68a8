//! Build sources handed to workers, with the revision context they build for

use apihub_common::error::{codes, ApiError};
use apihub_common::types::{
    BuildConfig, BuildContext, BuildSourcePayload, PreviousRevision, VersionRef,
};
use sqlx::{PgConnection, PgPool};

use super::{get_build, QueueResult};
use crate::db::versions;

#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    source: Vec<u8>,
    config: serde_json::Value,
}

/// Source archive, config and revision context of a build
#[tracing::instrument(skip(pool))]
pub async fn get_build_source(pool: &PgPool, build_id: &str) -> QueueResult<BuildSourcePayload> {
    get_build(pool, build_id).await?;

    let row = sqlx::query_as::<_, SourceRow>("SELECT source, config FROM build_src WHERE build_id = $1")
        .bind(build_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::new(codes::BUILD_SOURCE_NOT_FOUND).param("id", build_id))?;

    let config: BuildConfig = serde_json::from_value(row.config)?;
    let mut conn = pool.acquire().await?;
    let context = build_context(&mut conn, &config).await?;

    Ok(BuildSourcePayload {
        build_id: build_id.to_string(),
        config,
        source: row.source,
        context,
    })
}

/// Where the artifact of `config` lands and what it is compared against.
///
/// A regular build targets `max + 1` of its version. A migration build
/// (`version@revision`) republishes the pinned revision. Changelog, group and
/// export builds work on the published revision they name, the latest live
/// one unless pinned. The previous side is the declared previous version, or
/// else the latest live revision of the same version.
pub async fn build_context(conn: &mut PgConnection, config: &BuildConfig) -> QueueResult<BuildContext> {
    let target: VersionRef = config.version.parse().map_err(ApiError::from)?;

    let revision = match target.revision {
        _ if !config.build_type.publishes_revision() => {
            versions::resolve_revision(&mut *conn, &config.package_id, &config.version)
                .await?
                .revision
        },
        Some(pinned) if config.migration_build => pinned,
        _ => {
            versions::max_revision_no(&mut *conn, &config.package_id, &target.version)
                .await?
                .unwrap_or(0)
                + 1
        },
    };

    let previous = match config.previous_version {
        Some(ref previous_version) => {
            let previous_ref: VersionRef = previous_version.parse().map_err(ApiError::from)?;
            versions::find_revision(&mut *conn, config.previous_package_id(), &previous_ref).await?
        },
        None if config.migration_build => None,
        None => versions::find_revision(&mut *conn, &config.package_id, &VersionRef::latest(&target.version))
            .await?
            .filter(|rev| rev.revision < revision),
    };

    Ok(BuildContext {
        package_id: config.package_id.clone(),
        version: target.version,
        revision,
        previous: previous.map(|rev| PreviousRevision {
            package_id: rev.package_id,
            version: rev.version,
            revision: rev.revision,
        }),
    })
}
