use std::{fmt::Display, ops::RangeInclusive};

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    extractor::{resolve_endpoint, unwrap_singleton, Extractor, Params},
    store::DataStore,
};

pub const CAMPUS_CITY: &str = "Rio de Janeiro";
pub const C_PISCINE_CURSUS_ID: u64 = 9;
pub const BASECAMP_CURSUS_ID: u64 = 51;
pub const POOL_YEAR: i32 = 2025;
pub const POOL_MONTHS: &str = "september,august";
pub const CAMPUS_POOL_YEARS: RangeInclusive<i32> = 2021..=2025;
pub const SAMPLE_USER_ID: u64 = 234800;

pub const CURSUS_DATASET: &str = "cursus_data";
pub const CAMPUS_DATASET: &str = "campus_data";
pub const CURSUS_USERS_DATASET: &str = "cursus_users_data";
pub const PROJECT_USERS_DATASET: &str = "project_users";

/// One extraction run. Each writes one or more datasets into the data
/// directory; later jobs read what earlier ones wrote.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum Job {
    /// All cursus and the campus record
    Initial,
    /// Project lists of the C piscine and basecamp curricula
    Curriculum,
    /// Pool users of the current piscine
    PoolUsers,
    /// Projects of every current pool user
    PoolProjects,
    /// Users of every pool year on the campus
    CampusUsers,
    /// Cursus and project enrollments of one user, unpaginated
    UserRecords,
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn pool_users_dataset(year: i32) -> String {
    format!("piscine_{year}_users")
}

pub fn pool_projects_dataset(year: i32) -> String {
    format!("piscine_{year}_projects_init")
}

pub fn campus_users_dataset(year: i32) -> String {
    format!("piscines_{year}_users")
}

/// Runs `job` and returns the names of the datasets it wrote.
pub async fn run(job: Job, extractor: &Extractor, store: &DataStore) -> Result<Vec<String>> {
    info!("running {} extraction", job);
    match job {
        Job::Initial => {
            extract_cursus(extractor, store).await?;
            extract_campus(extractor, store, CAMPUS_CITY).await?;
            Ok(vec![CURSUS_DATASET.into(), CAMPUS_DATASET.into()])
        }
        Job::Curriculum => {
            let mut written = Vec::new();
            for (cursus_id, name) in [
                (C_PISCINE_CURSUS_ID, "c_piscine_projects"),
                (BASECAMP_CURSUS_ID, "basecamp_piscine_projects"),
            ] {
                extract_curriculum(extractor, store, cursus_id, name).await?;
                written.push(name.to_string());
            }
            Ok(written)
        }
        Job::PoolUsers => {
            let campus_id = campus_id(&load_campus(extractor, store).await?)?;
            let name = pool_users_dataset(POOL_YEAR);
            extract_pool_users(extractor, store, &name, campus_id, POOL_YEAR, Some(POOL_MONTHS))
                .await?;
            Ok(vec![name])
        }
        Job::PoolProjects => {
            let campus_id = campus_id(&load_campus(extractor, store).await?)?;
            let users_name = pool_users_dataset(POOL_YEAR);
            let users: Vec<Value> = store
                .read(&users_name)
                .with_context(|| format!("run the pool-users job first, {users_name} is needed"))?;
            let name = pool_projects_dataset(POOL_YEAR);
            extract_pool_projects(extractor, store, &name, campus_id, &users).await?;
            Ok(vec![name])
        }
        Job::CampusUsers => {
            let campus_id = campus_id(&load_campus(extractor, store).await?)?;
            let mut written = Vec::new();
            for year in CAMPUS_POOL_YEARS {
                info!("fetching {} users", year);
                let name = campus_users_dataset(year);
                extract_pool_users(extractor, store, &name, campus_id, year, None).await?;
                written.push(name);
            }
            Ok(written)
        }
        Job::UserRecords => {
            let mut written = Vec::new();
            for (template, name) in [
                ("users/{user_id}/cursus_users", CURSUS_USERS_DATASET),
                ("users/{user_id}/projects_users", PROJECT_USERS_DATASET),
            ] {
                extract_user_record(extractor, store, template, SAMPLE_USER_ID, name).await?;
                written.push(name.to_string());
            }
            Ok(written)
        }
    }
}

pub async fn extract_cursus(extractor: &Extractor, store: &DataStore) -> Result<()> {
    let cursus = extractor
        .fetch_all("cursus", &Params::new(), &Params::new())
        .await
        .context("failed to extract cursus")?;
    info!("total cursus found: {}", cursus.len());
    store.write(CURSUS_DATASET, &cursus)?;
    Ok(())
}

/// Looks the campus up by city and stores the single matching record.
pub async fn extract_campus(extractor: &Extractor, store: &DataStore, city: &str) -> Result<Value> {
    info!("extracting {} campus data", city);
    let mut campuses = extractor
        .fetch_all("campus", &Params::new(), &Params::new().with("filter[city]", city))
        .await
        .with_context(|| format!("failed to extract campus in {}", city))?;
    if campuses.is_empty() {
        bail!("no campus found in {}", city);
    }
    if campuses.len() > 1 {
        warn!("{} campuses found in {}, keeping the first", campuses.len(), city);
        campuses.truncate(1);
    }
    let campus = unwrap_singleton(campuses);
    store.write(CAMPUS_DATASET, &campus)?;
    Ok(campus)
}

/// The stored campus record, fetched again if an earlier run never wrote it.
pub async fn load_campus(extractor: &Extractor, store: &DataStore) -> Result<Value> {
    match store.read_if_exists::<Value>(CAMPUS_DATASET)? {
        Some(campus) => Ok(campus),
        None => {
            warn!("unable to read campus data from file, retrieving it again");
            extract_campus(extractor, store, CAMPUS_CITY).await
        }
    }
}

pub fn campus_id(campus: &Value) -> Result<u64> {
    campus["id"]
        .as_u64()
        .ok_or_else(|| anyhow!("campus record has no numeric id"))
}

pub async fn extract_curriculum(
    extractor: &Extractor,
    store: &DataStore,
    cursus_id: u64,
    name: &str,
) -> Result<()> {
    let projects = extractor
        .fetch_all(
            "cursus/{cursus_id}/projects",
            &Params::new().with("cursus_id", cursus_id),
            &Params::new(),
        )
        .await
        .with_context(|| format!("failed to extract projects of cursus {}", cursus_id))?;
    info!("total projects found: {}", projects.len());
    store.write(name, &projects)?;
    Ok(())
}

pub async fn extract_pool_users(
    extractor: &Extractor,
    store: &DataStore,
    name: &str,
    campus_id: u64,
    year: i32,
    months: Option<&str>,
) -> Result<()> {
    let query = Params::new()
        .with("filter[pool_year]", year)
        .with_opt("filter[pool_month]", months)
        .with("filter[primary_campus_id]", campus_id);
    let users = extractor
        .fetch_all("users", &Params::new(), &query)
        .await
        .with_context(|| format!("failed to extract {} pool users", year))?;
    info!("total users found: {}", users.len());
    store.write(name, &users)?;
    Ok(())
}

/// Project enrollments of every user, flattened in user order.
pub async fn extract_pool_projects(
    extractor: &Extractor,
    store: &DataStore,
    name: &str,
    campus_id: u64,
    users: &[Value],
) -> Result<()> {
    let query = Params::new()
        .with("cursus", C_PISCINE_CURSUS_ID)
        .with("campus", campus_id);

    let mut projects = Vec::new();
    for (i, user) in users.iter().enumerate() {
        let user_id = user["id"]
            .as_u64()
            .ok_or_else(|| anyhow!("user record #{} has no numeric id", i))?;
        let user_projects = extractor
            .fetch_all(
                "users/{user_id}/projects_users",
                &Params::new().with("user_id", user_id),
                &query,
            )
            .await
            .with_context(|| format!("failed to extract projects of user {}", user_id))?;
        projects.extend(user_projects.into_iter().filter(|p| !p.is_null()));
    }

    info!("total project enrollments found: {}", projects.len());
    store.write(name, &projects)?;
    Ok(())
}

/// One plain GET under a user, stored as returned.
pub async fn extract_user_record(
    extractor: &Extractor,
    store: &DataStore,
    template: &str,
    user_id: u64,
    name: &str,
) -> Result<()> {
    let endpoint = resolve_endpoint(template, &Params::new().with("user_id", user_id))?;
    let record = extractor
        .fetch_one(&endpoint, &Params::new())
        .await
        .with_context(|| format!("failed to extract {}", endpoint))?;
    store.write(name, &record)?;
    Ok(())
}
