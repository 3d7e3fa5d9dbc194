//! PostgreSQL catalog store

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use super::{check_batch, record_hash, CatalogStore};
use crate::classifier::ExistingHashIndex;
use crate::config::DatabaseConfig;
use crate::error::{IngestError, Result, StoreError};
use crate::models::{
    Artist, ArtistCredit, CatalogRecord, FileType, Label, Master, NaturalKey, Release,
};

/// Open a connection pool from configuration
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| IngestError::InvalidConfig("DATABASE_URL is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "Connected to database");
    Ok(pool)
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

fn table(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Labels => "labels",
        FileType::Artists => "artists",
        FileType::Masters => "masters",
        FileType::Releases => "releases",
    }
}

/// Catalog store on the `labels`/`artists`/`masters`/`releases` tables
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn load_hashes(&self, file_type: FileType) -> Result<ExistingHashIndex, StoreError> {
        let sql = format!("SELECT discogs_id, content_hash FROM {}", table(file_type));
        let mut rows = sqlx::query_as::<_, (i64, String)>(&sql).fetch(&self.pool);

        let mut index = ExistingHashIndex::new();
        while let Some((id, hash)) = rows.try_next().await? {
            index.insert(NaturalKey::Id(id), hash);
        }

        debug!(file_type = %file_type, rows = index.len(), "Loaded existing hash index");
        Ok(index)
    }

    async fn upsert_batch(
        &self,
        file_type: FileType,
        records: &[CatalogRecord],
    ) -> Result<(), StoreError> {
        check_batch(file_type, records)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            let hash = record_hash(record);
            match record {
                CatalogRecord::Label(label) => upsert_label(&mut tx, label, &hash).await?,
                CatalogRecord::Artist(artist) => upsert_artist(&mut tx, artist, &hash).await?,
                CatalogRecord::Master(master) => upsert_master(&mut tx, master, &hash).await?,
                CatalogRecord::Release(release) => upsert_release(&mut tx, release, &hash).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count(&self, file_type: FileType) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table(file_type));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

async fn upsert_label(
    conn: &mut PgConnection,
    label: &Label,
    hash: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO labels (
            discogs_id, name, contact_info, profile, data_quality, urls,
            parent_label_id, parent_label_name, content_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (discogs_id) DO UPDATE SET
            name = EXCLUDED.name,
            contact_info = EXCLUDED.contact_info,
            profile = EXCLUDED.profile,
            data_quality = EXCLUDED.data_quality,
            urls = EXCLUDED.urls,
            parent_label_id = EXCLUDED.parent_label_id,
            parent_label_name = EXCLUDED.parent_label_name,
            content_hash = EXCLUDED.content_hash,
            updated_at = NOW()
        "#,
    )
    .bind(label.id)
    .bind(&label.name)
    .bind(&label.contact_info)
    .bind(&label.profile)
    .bind(&label.data_quality)
    .bind(&label.urls)
    .bind(label.parent_label.as_ref().and_then(|p| p.id))
    .bind(label.parent_label.as_ref().map(|p| p.name.as_str()))
    .bind(hash)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_artist(
    conn: &mut PgConnection,
    artist: &Artist,
    hash: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO artists (
            discogs_id, name, real_name, profile, data_quality, urls,
            name_variations, content_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (discogs_id) DO UPDATE SET
            name = EXCLUDED.name,
            real_name = EXCLUDED.real_name,
            profile = EXCLUDED.profile,
            data_quality = EXCLUDED.data_quality,
            urls = EXCLUDED.urls,
            name_variations = EXCLUDED.name_variations,
            content_hash = EXCLUDED.content_hash,
            updated_at = NOW()
        "#,
    )
    .bind(artist.id)
    .bind(&artist.name)
    .bind(&artist.real_name)
    .bind(&artist.profile)
    .bind(&artist.data_quality)
    .bind(&artist.urls)
    .bind(&artist.name_variations)
    .bind(hash)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Column vectors of a credit list, for `UNNEST` inserts
struct CreditColumns {
    seq: Vec<i32>,
    artist_id: Vec<Option<i64>>,
    name: Vec<String>,
    anv: Vec<Option<String>>,
    join: Vec<Option<String>>,
    role: Vec<Option<String>>,
}

impl CreditColumns {
    fn from(credits: &[ArtistCredit]) -> Self {
        Self {
            seq: (0..credits.len() as i32).collect(),
            artist_id: credits.iter().map(|c| c.id).collect(),
            name: credits.iter().map(|c| c.name.clone()).collect(),
            anv: credits.iter().map(|c| c.anv.clone()).collect(),
            join: credits.iter().map(|c| c.join.clone()).collect(),
            role: credits.iter().map(|c| c.role.clone()).collect(),
        }
    }
}

async fn upsert_master(
    conn: &mut PgConnection,
    master: &Master,
    hash: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO masters (
            discogs_id, title, main_release_id, year, data_quality, notes,
            genres, styles, content_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (discogs_id) DO UPDATE SET
            title = EXCLUDED.title,
            main_release_id = EXCLUDED.main_release_id,
            year = EXCLUDED.year,
            data_quality = EXCLUDED.data_quality,
            notes = EXCLUDED.notes,
            genres = EXCLUDED.genres,
            styles = EXCLUDED.styles,
            content_hash = EXCLUDED.content_hash,
            updated_at = NOW()
        "#,
    )
    .bind(master.id)
    .bind(&master.title)
    .bind(master.main_release)
    .bind(master.year)
    .bind(&master.data_quality)
    .bind(&master.notes)
    .bind(&master.genres)
    .bind(&master.styles)
    .bind(hash)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM master_artists WHERE master_id = $1")
        .bind(master.id)
        .execute(&mut *conn)
        .await?;

    if !master.artists.is_empty() {
        let cols = CreditColumns::from(&master.artists);
        sqlx::query(
            r#"
            INSERT INTO master_artists (master_id, seq, artist_id, name, anv, join_phrase, role)
            SELECT $1, * FROM UNNEST($2::int[], $3::bigint[], $4::text[], $5::text[], $6::text[], $7::text[])
            "#,
        )
        .bind(master.id)
        .bind(&cols.seq)
        .bind(&cols.artist_id)
        .bind(&cols.name)
        .bind(&cols.anv)
        .bind(&cols.join)
        .bind(&cols.role)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_release_credits(
    conn: &mut PgConnection,
    release_id: i64,
    credits: &[ArtistCredit],
    extra: bool,
) -> std::result::Result<(), sqlx::Error> {
    if credits.is_empty() {
        return Ok(());
    }
    let cols = CreditColumns::from(credits);
    sqlx::query(
        r#"
        INSERT INTO release_artists (release_id, extra, seq, artist_id, name, anv, join_phrase, role)
        SELECT $1, $2, * FROM UNNEST($3::int[], $4::bigint[], $5::text[], $6::text[], $7::text[], $8::text[])
        "#,
    )
    .bind(release_id)
    .bind(extra)
    .bind(&cols.seq)
    .bind(&cols.artist_id)
    .bind(&cols.name)
    .bind(&cols.anv)
    .bind(&cols.join)
    .bind(&cols.role)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Upsert a release and replace its credits, labels and tracks
async fn upsert_release(
    conn: &mut PgConnection,
    release: &Release,
    hash: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO releases (
            discogs_id, title, status, country, released, notes, data_quality,
            master_id, is_main_release, genres, styles, content_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (discogs_id) DO UPDATE SET
            title = EXCLUDED.title,
            status = EXCLUDED.status,
            country = EXCLUDED.country,
            released = EXCLUDED.released,
            notes = EXCLUDED.notes,
            data_quality = EXCLUDED.data_quality,
            master_id = EXCLUDED.master_id,
            is_main_release = EXCLUDED.is_main_release,
            genres = EXCLUDED.genres,
            styles = EXCLUDED.styles,
            content_hash = EXCLUDED.content_hash,
            updated_at = NOW()
        "#,
    )
    .bind(release.id)
    .bind(&release.title)
    .bind(&release.status)
    .bind(&release.country)
    .bind(&release.released)
    .bind(&release.notes)
    .bind(&release.data_quality)
    .bind(release.master_id)
    .bind(release.is_main_release)
    .bind(&release.genres)
    .bind(&release.styles)
    .bind(hash)
    .execute(&mut *conn)
    .await?;

    for child in ["release_artists", "release_labels", "release_tracks"] {
        sqlx::query(&format!("DELETE FROM {} WHERE release_id = $1", child))
            .bind(release.id)
            .execute(&mut *conn)
            .await?;
    }

    insert_release_credits(conn, release.id, &release.artists, false).await?;
    insert_release_credits(conn, release.id, &release.extra_artists, true).await?;

    if !release.labels.is_empty() {
        let seq: Vec<i32> = (0..release.labels.len() as i32).collect();
        let label_id: Vec<Option<i64>> = release.labels.iter().map(|l| l.id).collect();
        let name: Vec<String> = release.labels.iter().map(|l| l.name.clone()).collect();
        let catno: Vec<Option<String>> = release.labels.iter().map(|l| l.catno.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO release_labels (release_id, seq, label_id, name, catno)
            SELECT $1, * FROM UNNEST($2::int[], $3::bigint[], $4::text[], $5::text[])
            "#,
        )
        .bind(release.id)
        .bind(&seq)
        .bind(&label_id)
        .bind(&name)
        .bind(&catno)
        .execute(&mut *conn)
        .await?;
    }

    if !release.tracklist.is_empty() {
        let seq: Vec<i32> = (0..release.tracklist.len() as i32).collect();
        let position: Vec<String> = release.tracklist.iter().map(|t| t.position.clone()).collect();
        let title: Vec<String> = release.tracklist.iter().map(|t| t.title.clone()).collect();
        let duration: Vec<Option<String>> =
            release.tracklist.iter().map(|t| t.duration.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO release_tracks (release_id, seq, position, title, duration)
            SELECT $1, * FROM UNNEST($2::int[], $3::text[], $4::text[], $5::text[])
            "#,
        )
        .bind(release.id)
        .bind(&seq)
        .bind(&position)
        .bind(&title)
        .bind(&duration)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
