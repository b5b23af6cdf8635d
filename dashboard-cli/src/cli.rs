use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dashboard_core::{
    AppConfig, Dashboard, DetailSection, ProviderId, SavedLocation, SearchEvent, SearchOutcome,
    SectionMove, Settings, SettingsPatch, TimeFormat, WeatherReport,
    display::{format_clock, format_hour_label, format_temperature, format_wind},
};
use inquire::{Confirm, Password, Select, Text};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-dashboard", version, about = "Multi-provider weather dashboard")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweathermap", "weatherapi", "qweather" or "custom".
        provider: ProviderId,

        /// Also make it the active provider.
        #[arg(long)]
        activate: bool,
    },

    /// Show or change settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Search for a city and pick one to save.
    Search {
        /// City name, at least two characters.
        query: String,
    },

    /// Save the best match for a query without prompting.
    Add {
        query: String,

        /// Position in the result list to take instead of the first.
        #[arg(long, default_value_t = 1)]
        pick: usize,
    },

    /// List saved cities in display order.
    List,

    /// Remove a saved city (by position, name or id).
    Remove { city: String },

    /// Reorder saved cities.
    Move {
        city: String,

        /// New 1-based position.
        #[arg(long, conflicts_with = "onto", required_unless_present = "onto")]
        to: Option<usize>,

        /// Drop the city onto another one, taking its position.
        #[arg(long)]
        onto: Option<String>,
    },

    /// Show weather for one saved city, or all of them.
    Show { city: Option<String> },

    /// Show or reorder the detail view sections.
    Sections {
        #[command(subcommand)]
        command: Option<SectionsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,

    /// e.g. `settings set time-format 12h` or `settings set provider weatherapi`.
    Set { field: String, value: String },
}

#[derive(Debug, Subcommand)]
pub enum SectionsCommand {
    Up { section: String },
    Down { section: String },
}

impl Cli {
    pub async fn run(self, config: &AppConfig) -> Result<()> {
        tracing::debug!(command = ?self.command, "running command");
        let dashboard = Dashboard::from_config(config)?;

        match self.command {
            Command::Configure { provider, activate } => configure(&dashboard, provider, activate).await,
            Command::Settings { command: SettingsCommand::Show } => {
                print_settings(&dashboard.settings());
                Ok(())
            }
            Command::Settings { command: SettingsCommand::Set { field, value } } => {
                let patch = SettingsPatch::from_field(&field, &value)?;
                let settings = dashboard.update_settings(patch).await?;
                print_settings(&settings);
                Ok(())
            }
            Command::Search { query } => search(&dashboard, &query).await,
            Command::Add { query, pick } => {
                let candidates = dashboard.search(&query).await?;
                let candidate = candidates
                    .get(pick.saturating_sub(1))
                    .ok_or_else(|| anyhow!("No match #{pick} for '{query}' ({} found)", candidates.len()))?;
                let saved = dashboard.add_location(candidate)?;
                println!("Saved {} ({:.4}, {:.4})", saved.display_name, saved.lat, saved.lon);
                Ok(())
            }
            Command::List => {
                print_locations(&dashboard);
                Ok(())
            }
            Command::Remove { city } => {
                let pending = dashboard
                    .unresolved_locations()
                    .into_iter()
                    .find(|name| name.eq_ignore_ascii_case(&city));
                if let Some(name) = pending {
                    dashboard.forget_unresolved(&name)?;
                    println!("Removed {name}");
                    return Ok(());
                }
                let location = resolve_city(&dashboard, &city)?;
                dashboard.remove_location(&location.id)?;
                println!("Removed {}", location.display_name);
                Ok(())
            }
            Command::Move { city, to, onto } => {
                let location = resolve_city(&dashboard, &city)?;
                match (to, onto) {
                    (_, Some(target)) => {
                        let target = resolve_city(&dashboard, &target)?;
                        dashboard.move_location_onto(&location.id, &target.id)?;
                    }
                    (Some(position), None) => {
                        dashboard.reorder_location(&location.id, position.saturating_sub(1))?;
                    }
                    (None, None) => bail!("Either --to or --onto is required"),
                }
                print_locations(&dashboard);
                Ok(())
            }
            Command::Show { city } => show(&dashboard, city.as_deref()).await,
            Command::Sections { command } => {
                if let Some(command) = command {
                    let (section, direction) = match command {
                        SectionsCommand::Up { section } => (section, SectionMove::Up),
                        SectionsCommand::Down { section } => (section, SectionMove::Down),
                    };
                    let section: DetailSection = section.parse()?;
                    dashboard.move_section(section, direction).await?;
                }
                print_sections(&dashboard);
                Ok(())
            }
        }
    }
}

async fn configure(dashboard: &Dashboard, provider: ProviderId, activate: bool) -> Result<()> {
    let mut patch = SettingsPatch::default();

    if provider == ProviderId::Custom {
        let url = Text::new("Base URL of the custom weather endpoint:")
            .prompt()
            .context("Failed to read URL")?;
        patch.custom_url = Some(url);
    }

    if provider == ProviderId::QWeather {
        let host = Text::new("QWeather API host (leave empty for devapi.qweather.com):")
            .prompt()
            .context("Failed to read host")?;
        patch.qweather_host = Some(host);
    }

    let key = Password::new(&format!("API key for {provider}:"))
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;
    patch.api_keys = Some(BTreeMap::from([(provider, key.trim().to_string())]));

    let settings = dashboard.settings();
    let activate = activate
        || (settings.active_provider != provider
            && !settings.is_provider_configured(settings.active_provider)
            && Confirm::new(&format!("Make {provider} the active provider?"))
                .with_default(true)
                .prompt()
                .unwrap_or(false));
    if activate {
        patch.active_provider = Some(provider);
    }

    let settings = dashboard.update_settings(patch).await?;
    println!("Configured {provider}. Active provider: {}", settings.active_provider);
    Ok(())
}

async fn search(dashboard: &Dashboard, query: &str) -> Result<()> {
    let mut controller = dashboard.search_controller();
    controller.input(query);

    match controller.next_outcome().await {
        None => bail!("Query '{query}' is too short"),
        Some(SearchOutcome::NoResults) => {
            println!("No cities match '{query}'");
            return Ok(());
        }
        Some(SearchOutcome::Failed(err)) => return Err(err.into()),
        Some(SearchOutcome::Suggestions(_)) => {}
    }

    let labels: Vec<String> = controller
        .suggestions()
        .iter()
        .map(|s| candidate_label(&s.candidate.name, &s.candidate.region, &s.candidate.country))
        .collect();

    let Some(choice) = Select::new("Save which city?", labels.clone())
        .prompt_skippable()
        .context("Failed to read selection")?
    else {
        controller.blur();
        return Ok(());
    };

    let index = labels.iter().position(|l| *l == choice).unwrap_or_default();
    if let Some(SearchEvent::Selected(candidate)) = controller.click(index) {
        let saved = dashboard.add_location(&candidate)?;
        println!("Saved {}", saved.display_name);
    }
    Ok(())
}

async fn show(dashboard: &Dashboard, city: Option<&str>) -> Result<()> {
    let settings = dashboard.settings();

    let location = match city {
        Some(city) => Some(resolve_city(dashboard, city)?),
        None => dashboard.startup_location(),
    };

    let reports = match location {
        Some(location) => {
            let report = dashboard.weather(&location.id).await;
            vec![(location, report)]
        }
        None => dashboard.weather_for_all().await,
    };

    if reports.is_empty() {
        println!("No saved cities. Add one with `weather-dashboard search <city>`.");
    }

    for (location, report) in reports {
        match report {
            Ok(report) => print_report(&location, &report, &settings),
            Err(err) => println!("{}: {err}\n", location.display_name),
        }
    }
    Ok(())
}

/// Accepts a 1-based position, an id or a case-insensitive name.
fn resolve_city(dashboard: &Dashboard, city: &str) -> Result<SavedLocation> {
    let locations = dashboard.locations();

    if let Ok(position) = city.parse::<usize>() {
        if let Some(location) = position.checked_sub(1).and_then(|i| locations.get(i)) {
            return Ok(location.clone());
        }
    }

    locations
        .iter()
        .find(|l| l.id == city || l.display_name.eq_ignore_ascii_case(city))
        .cloned()
        .ok_or_else(|| anyhow!("No saved city matches '{city}'. Run `weather-dashboard list`."))
}

fn candidate_label(name: &str, region: &str, country: &str) -> String {
    [name, region, country].iter().filter(|s| !s.is_empty()).copied().collect::<Vec<_>>().join(", ")
}

fn print_locations(dashboard: &Dashboard) {
    let locations = dashboard.locations();
    let unresolved = dashboard.unresolved_locations();
    if locations.is_empty() && unresolved.is_empty() {
        println!("No saved cities.");
    }
    for location in &locations {
        println!(
            "{:>2}. {:<24} {:<15} {}",
            location.sort_index + 1,
            location.display_name,
            location.provider,
            location.id
        );
    }
    for name in &unresolved {
        println!(" -. {name:<24} (looked up on the next `show`)");
    }
}

fn print_settings(settings: &Settings) {
    println!("Active provider:   {}", settings.active_provider);
    for &provider in ProviderId::all() {
        let state = if settings.is_provider_configured(provider) { "configured" } else { "-" };
        println!("  {provider:<15} {state}");
    }
    println!("Refresh interval:  {} min", settings.auto_refresh_interval_minutes);
    let time_format = match settings.time_format {
        TimeFormat::TwelveHour => "12h",
        TimeFormat::TwentyFourHour => "24h",
    };
    println!("Time format:       {time_format}");
    println!("Theme:             {:?}", settings.theme);
    println!("Language:          {}", settings.language);
    println!("Startup view:      {:?}", settings.startup_view);
    let sections: Vec<&str> = settings.detail_view_section_order.iter().map(|s| s.as_str()).collect();
    println!("Sections:          {}", sections.join(", "));
}

fn print_sections(dashboard: &Dashboard) {
    for (i, control) in dashboard.section_controls().iter().enumerate() {
        let up = if control.can_move_up { "↑" } else { " " };
        let down = if control.can_move_down { "↓" } else { " " };
        println!("{}. {:<12} {up}{down}", i + 1, control.section);
    }
}

fn print_report(location: &SavedLocation, report: &WeatherReport, settings: &Settings) {
    let weather = &report.weather;
    let offset = weather.utc_offset_seconds;
    let time_format = settings.time_format;

    println!("{} ({})", location.display_name, report.provider);
    if let Some(warning) = &report.warning {
        println!("  ! {warning}");
    }
    println!(
        "  {} {}, feels like {}",
        format_temperature(weather.temperature_c),
        weather.condition.summary,
        format_temperature(weather.feels_like_c)
    );

    for section in &settings.detail_view_section_order {
        match section {
            DetailSection::Hourly if !weather.forecast_hourly.is_empty() => {
                let hours: Vec<String> = weather
                    .forecast_hourly
                    .iter()
                    .take(8)
                    .map(|h| {
                        format!(
                            "{} {}",
                            format_hour_label(h.epoch, offset, time_format),
                            format_temperature(h.temp_c)
                        )
                    })
                    .collect();
                println!("  Hourly:      {}", hours.join(" | "));
            }
            DetailSection::Daily if !weather.forecast_daily.is_empty() => {
                for day in &weather.forecast_daily {
                    println!(
                        "  {}:  {} / {} {}",
                        day.date.format("%a %d %b"),
                        format_temperature(day.max_temp_c),
                        format_temperature(day.min_temp_c),
                        day.condition.summary
                    );
                }
            }
            DetailSection::Conditions => {
                println!(
                    "  Conditions:  humidity {}%, pressure {:.0} hPa, wind {}, visibility {:.1} km",
                    weather.humidity_pct,
                    weather.pressure_hpa,
                    format_wind(weather.wind.speed_kph, weather.wind.degrees),
                    f64::from(weather.visibility_m) / 1000.0
                );
            }
            DetailSection::Sun => {
                if let Some(sun) = &weather.sun {
                    println!(
                        "  Sun:         rise {}, set {}",
                        format_clock(sun.sunrise_epoch, offset, time_format),
                        format_clock(sun.sunset_epoch, offset, time_format)
                    );
                }
            }
            DetailSection::AirQuality => {
                if let Some(aq) = &weather.air_quality {
                    println!("  Air quality: index {}", aq.index);
                }
            }
            _ => {}
        }
    }

    let updated = format_clock(report.fetched_at_epoch, offset, time_format);
    let age_minutes = (chrono::Utc::now().timestamp() - report.fetched_at_epoch).max(0) / 60;
    println!(
        "  Updated {updated} ({age_minutes} min ago){}\n",
        if report.stale { ", stale" } else { "" }
    );
}
