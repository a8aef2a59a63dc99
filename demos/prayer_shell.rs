//! Boots a small prayer-app plugin graph against a text surface and walks a few views.
//!
//! Run with `cargo run --example prayer_shell`. State is persisted under a
//! temporary directory, so a second run in the same session restores it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use atrium::state::keys::{self, Location};
use atrium::{
    Dependencies, DependencyPolicy, Engine, FileStore, LocationChanged, LogLevel, Logger,
    MountTarget, PluginDescriptor, PluginMetadata, Shell, ShellConfig, StateStore, StderrSink,
    View, topics,
};
use parking_lot::Mutex;

/// Mount target that prints each rendered frame.
struct TextSurface {
    frame: Mutex<u32>,
}

impl TextSurface {
    fn paint(&self, lines: &[String]) {
        let mut frame = self.frame.lock();
        *frame += 1;
        println!("---- frame {} ----", *frame);
        for line in lines {
            println!("{line}");
        }
    }
}

impl MountTarget for TextSurface {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn surface(mount: &dyn MountTarget) -> Result<&TextSurface> {
    mount
        .as_any()
        .downcast_ref::<TextSurface>()
        .ok_or_else(|| anyhow::anyhow!("prayer demo expects a text surface"))
}

struct SettingsEngine {
    state: StateStore,
}

#[async_trait]
impl Engine for SettingsEngine {
    async fn init(&self) -> Result<()> {
        if self.state.get_typed(&keys::LANGUAGE)?.is_none() {
            self.state.set_typed(&keys::LANGUAGE, &"en".to_string())?;
        }
        if self.state.get_typed(&keys::LOCATION)?.is_none() {
            self.state.set_typed(
                &keys::LOCATION,
                &Location {
                    city: "Cairo".into(),
                    country: "EG".into(),
                    latitude: Some(30.04),
                    longitude: Some(31.24),
                },
            )?;
        }
        Ok(())
    }
}

struct SettingsView {
    state: StateStore,
}

impl View for SettingsView {
    fn render(&self, mount: &dyn MountTarget) -> Result<()> {
        let language = self.state.get_typed(&keys::LANGUAGE)?.unwrap_or_default();
        let theme = self.state.get_typed(&keys::THEME)?.unwrap_or_default();
        surface(mount)?.paint(&[
            "Settings".to_string(),
            format!("  language: {language}"),
            format!("  theme:    {theme:?}"),
        ]);
        Ok(())
    }
}

struct PrayerTimesEngine {
    state: StateStore,
    city: Mutex<String>,
}

impl PrayerTimesEngine {
    fn build(deps: &Dependencies) -> Arc<Self> {
        let engine = Arc::new(Self {
            state: deps.state.clone(),
            city: Mutex::new(String::new()),
        });
        let listener = Arc::clone(&engine);
        deps.events.on(topics::LOCATION_CHANGED, move |payload| {
            let changed: LocationChanged = serde_json::from_value(payload.clone())?;
            *listener.city.lock() = format!("{}, {}", changed.city, changed.country);
            Ok(())
        });
        engine
    }
}

#[async_trait]
impl Engine for PrayerTimesEngine {
    async fn init(&self) -> Result<()> {
        // Stands in for fetching the day's timetable.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let location = self
            .state
            .get_typed(&keys::LOCATION)?
            .ok_or_else(|| anyhow::anyhow!("settings did not provide a location"))?;
        *self.city.lock() = format!("{}, {}", location.city, location.country);
        Ok(())
    }
}

struct PrayerTimesView {
    engine: Arc<PrayerTimesEngine>,
}

impl View for PrayerTimesView {
    fn render(&self, mount: &dyn MountTarget) -> Result<()> {
        let city = self.engine.city.lock().clone();
        surface(mount)?.paint(&[
            format!("Prayer times for {city}"),
            "  fajr 04:12  dhuhr 11:58  asr 15:21".to_string(),
            "  maghrib 18:03  isha 19:24".to_string(),
        ]);
        Ok(())
    }
}

struct HomeView;

impl View for HomeView {
    fn render(&self, mount: &dyn MountTarget) -> Result<()> {
        surface(mount)?.paint(&["Home".to_string(), "  [prayer] [settings]".to_string()]);
        Ok(())
    }
}

fn descriptors() -> Vec<PluginDescriptor> {
    vec![
        PluginDescriptor::new(
            "prayer",
            PluginMetadata::new()
                .depends_on(["settings"])
                .routes(["prayer*"]),
            |deps| {
                let engine = PrayerTimesEngine::build(deps);
                let view = Arc::new(PrayerTimesView {
                    engine: Arc::clone(&engine),
                });
                Ok(atrium::Plugin::new().with_engine(engine).with_view(view))
            },
        ),
        PluginDescriptor::engine_with_view(
            "settings",
            PluginMetadata::new().routes(["settings"]).init_order(0),
            |deps| {
                Ok(SettingsEngine {
                    state: deps.state.clone(),
                })
            },
            |deps, _engine| {
                Ok(SettingsView {
                    state: deps.state.clone(),
                })
            },
        ),
        PluginDescriptor::view_only("home", PluginMetadata::new().routes(["home"]), |_| {
            Ok(HomeView)
        }),
    ]
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut config = ShellConfig {
        logger: Some(Logger::new(StderrSink).with_min_level(LogLevel::Info)),
        init_timeout: Some(Duration::from_secs(2)),
        dependency_policy: DependencyPolicy::Strict,
        ..ShellConfig::default()
    };
    config.enable_metrics();

    let store = FileStore::open(std::env::temp_dir().join("atrium-prayer-demo"))?;
    let mount = Arc::new(TextSurface {
        frame: Mutex::new(0),
    });
    let shell = Shell::new(config, Arc::new(store), mount);

    shell.register_all(descriptors())?;
    shell.boot().await?;

    shell.navigate("prayer-times");
    shell.events().emit_with(
        topics::LOCATION_CHANGED,
        &LocationChanged {
            city: "Istanbul".into(),
            country: "TR".into(),
        },
    );
    shell.refresh();

    shell.state().set_typed(&keys::THEME, &keys::Theme::Dark)?;
    shell.navigate("settings");
    shell.navigate("qibla");

    shell.log_metrics();
    shell.shutdown();
    Ok(())
}
