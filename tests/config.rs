#![cfg(feature = "vkd-serde")]

use std::io::Write as _;

use serial_test::serial;
use vkdeferred::config::{RendererConfig, CONFIG_ENV};
use vkdeferred::shader::SourceLanguage;

#[test]
#[serial]
fn unset_variable_means_defaults() {
    std::env::remove_var(CONFIG_ENV);
    assert_eq!(RendererConfig::from_env().unwrap(), RendererConfig::default());
}

#[test]
#[serial]
fn variable_points_at_a_yaml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "descriptor_pool:\n  max_sets: 32\n  sampled_images: 12\nshader_language: glsl\ndebug_info: true"
    )
    .unwrap();

    std::env::set_var(CONFIG_ENV, file.path());
    let cfg = RendererConfig::from_env();
    std::env::remove_var(CONFIG_ENV);

    let cfg = cfg.unwrap();
    assert_eq!(cfg.descriptor_pool.max_sets, 32);
    assert_eq!(cfg.descriptor_pool.sampled_images, 12);
    assert_eq!(cfg.descriptor_pool.samplers, 2);
    assert_eq!(cfg.shader_language, SourceLanguage::Glsl);
    assert!(cfg.compiler_options().debug_info);
    assert!(cfg.disk_cache().is_none());
}

#[test]
#[serial]
fn missing_file_names_the_path() {
    std::env::set_var(CONFIG_ENV, "/nonexistent/vkdeferred.yaml");
    let err = RendererConfig::from_env().unwrap_err();
    std::env::remove_var(CONFIG_ENV);
    assert!(format!("{:#}", err).contains("/nonexistent/vkdeferred.yaml"));
}

#[test]
fn cache_dir_enables_the_disk_cache() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!("cache_dir: {}\n", dir.path().display());
    let cfg = RendererConfig::from_yaml_str(&yaml).unwrap();
    assert_eq!(cfg.disk_cache().unwrap().root(), dir.path());
}
