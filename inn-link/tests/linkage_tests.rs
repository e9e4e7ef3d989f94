//! End-to-end linkage tests
//!
//! Small synthetic registry and participant tables run through the full
//! linker, either from files in a temporary data directory or in memory.

use inn_common::config::LinkageConfig;
use inn_common::{CorrectionTable, CsvTable, DataLayout, Dataset};
use inn_link::records::CoordinateRecord;
use inn_link::{LinkInputs, LinkSource, LinkedTable, RecordLinker};
use std::collections::HashSet;
use std::path::Path;
use tempfile::TempDir;

const CORRECTIONS: &str = r#"
version = 1

[nit_remap]
"18217688" = "88217688"

[[centers]]
name = "Suba"
city = "Bogotá"
latitude = 4.746
longitude = -74.083

[[centers]]
name = "Cali Norte"
city = "Cali"
latitude = 3.47
longitude = -76.531

[[centers]]
name = "Medellín"
city = "Medellín"
latitude = 6.232
longitude = -75.569
"#;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn table(headers: &[&str], rows: &[&[&str]]) -> CsvTable {
    let mut t = CsvTable::new("test", headers.iter().map(|s| s.to_string()).collect());
    for row in rows {
        t.push_row(row.iter().map(|s| s.to_string()).collect());
    }
    t
}

fn coordinate(id: &str, lat: f64, lon: f64) -> CoordinateRecord {
    CoordinateRecord {
        id: id.to_string(),
        gmaps_address: Some(format!("address of {}", id)),
        latitude: Some(lat),
        longitude: Some(lon),
    }
}

fn linker() -> RecordLinker {
    let corrections = CorrectionTable::from_toml(CORRECTIONS).unwrap();
    RecordLinker::new(corrections, &LinkageConfig::default()).unwrap()
}

fn row<'a>(table: &'a CsvTable, up_id: &str) -> &'a Vec<String> {
    table
        .rows
        .iter()
        .find(|r| table.get(r, "up_id") == Some(up_id))
        .unwrap_or_else(|| panic!("no row for {}", up_id))
}

fn entity<'a>(linked: &'a LinkedTable, up_id: &str) -> &'a inn_link::LinkedEntity {
    linked.entities.iter().find(|e| e.up_id == up_id).unwrap()
}

/// Three registry entities over two years, two participants, one overlap
fn write_scenario(layout: &DataLayout) {
    write(
        &layout.rues_total(),
        "nit,source_year,city,ciiu_principal,empleados\n\
         900111,2023,BOGOTÁ,1410,3\n\
         900111,2024,BOGOTÁ,1410,4\n\
         900222,2023,CALI,1520,2\n\
         900222,2024,CALI,1520,2\n\
         900333,2023,MEDELLÍN,1410,5\n\
         900333,2024,,1410,6\n",
    );
    write(
        &layout.coordinates_csv(Dataset::Rues),
        "id,gmaps_address,latitude,longitude\n\
         900111,Cra 7 Bogotá,4.746,-74.083\n\
         900222,Cl 5 Cali,3.45,-76.53\n\
         900333,Cl 10 Medellín,6.24,-75.58\n",
    );
    write(
        &layout.zasca_total(),
        "numberid_emp1,nit,city,centro,yearcohort,cohort,sales2023\n\
         52000111,900222-1,Cali,Cali Norte,2023,1,100\n\
         52000222,,Bogotá,Suba,2022.0,2,200\n",
    );
    write(
        &layout.coordinates_csv(Dataset::Zasca),
        "id,gmaps_address,latitude,longitude\n\
         52000111,Cl 5 Cali participant,3.46,-76.52\n\
         52000222,Cra 9 Suba,4.75,-74.08\n",
    );
}

#[test]
fn test_end_to_end_from_files() {
    let temp_dir = TempDir::new().unwrap();
    let layout = DataLayout::new(temp_dir.path());
    write_scenario(&layout);
    assert!(LinkInputs::missing(&layout).is_empty());

    let linked = linker().run(&layout).unwrap();
    assert_eq!(linked.len(), 4);

    let output = CsvTable::read(&layout.linked_csv()).unwrap();
    assert_eq!(output.len(), 4);
    let ids: Vec<&str> = output.rows.iter().map(|r| output.get(r, "up_id").unwrap()).collect();
    assert_eq!(ids, vec!["52000222", "900111", "900222", "900333"]);

    // Overlap: registry coordinates win, participant fields carried
    let both = row(&output, "900222");
    assert_eq!(output.get(both, "link_source"), Some("both"));
    assert_eq!(output.get(both, "latitude"), Some("3.45"));
    assert_eq!(output.get(both, "gmaps_address"), Some("Cl 5 Cali"));
    assert_eq!(output.get(both, "city"), Some("Cali"));
    assert_eq!(output.get(both, "centro"), Some("Cali Norte"));
    assert_eq!(output.get(both, "sales2023"), Some("100"));
    assert_eq!(output.get(both, "empleados_2024"), Some("2"));

    // Registry only: pivoted panel and city from the latest year with one
    let registry_only = row(&output, "900333");
    assert_eq!(output.get(registry_only, "link_source"), Some("only_rues"));
    assert_eq!(output.get(registry_only, "empleados_2023"), Some("5"));
    assert_eq!(output.get(registry_only, "empleados_2024"), Some("6"));
    assert_eq!(output.get(registry_only, "city"), Some("Medellín"));
    assert_eq!(output.get(registry_only, "centro"), Some("Medellín"));

    // Participant only: nit filled from the internal id
    let participant_only = row(&output, "52000222");
    assert_eq!(output.get(participant_only, "link_source"), Some("only_zasca"));
    assert_eq!(output.get(participant_only, "latitude"), Some("4.75"));
    assert_eq!(output.get(participant_only, "empleados_2023"), None);
    assert_eq!(output.get(participant_only, "yearcohort"), Some("2022"));

    // Control unit sitting on the Suba centre inherits its cohort
    let control = row(&output, "900111");
    assert_eq!(output.get(control, "centro"), Some("Suba"));
    assert_eq!(output.get(control, "yearcohort"), Some("2022"));
    assert_eq!(output.get(control, "city"), Some("Bogotá"));
}

#[test]
fn test_missing_inputs_reported() {
    let temp_dir = TempDir::new().unwrap();
    let layout = DataLayout::new(temp_dir.path());
    write(&layout.rues_total(), "nit,source_year\n");

    let missing = LinkInputs::missing(&layout);
    assert_eq!(missing.len(), 3);
    assert!(!missing.contains(&layout.rues_total()));
}

#[test]
fn test_nearest_centre_respects_industry() {
    let inputs = LinkInputs {
        registry: table(
            &["nit", "source_year", "city", "ciiu_principal"],
            &[
                &["700001", "2023", "Bogotá", "1410"],
                &["700002", "2023", "Cali", "1520"],
                &["800001", "2023", "Bogotá", "1410"],
                &["800002", "2023", "Cali", "1410"],
            ],
        ),
        registry_coordinates: vec![
            coordinate("700001", 4.70, -74.05),
            coordinate("700002", 3.44, -76.52),
            // Exactly on the Suba centre
            coordinate("800001", 4.746, -74.083),
            // Exactly on Cali Norte, but its industry is only served by Suba
            coordinate("800002", 3.47, -76.531),
        ],
        participants: table(
            &["numberid_emp1", "nit", "city", "centro", "yearcohort"],
            &[
                &["11", "700001", "Bogotá", "Suba", "2021"],
                &["12", "700002", "Cali", "Cali Norte", "2023"],
            ],
        ),
        participant_coordinates: vec![coordinate("11", 4.70, -74.05), coordinate("12", 3.44, -76.52)],
    };

    let linked = linker().link(&inputs).unwrap();
    assert_eq!(linked.len(), 4);

    let on_suba = entity(&linked, "800001");
    assert!(!on_suba.treated);
    assert_eq!(on_suba.centro.as_deref(), Some("Suba"));
    assert_eq!(on_suba.yearcohort.as_deref(), Some("2021"));

    let on_cali = entity(&linked, "800002");
    assert_eq!(on_cali.centro.as_deref(), Some("Suba"));
    assert_eq!(on_cali.source, LinkSource::RegistryOnly);

    // Enrolled participants keep their own centre and cohort
    let treated = entity(&linked, "700002");
    assert_eq!(treated.centro.as_deref(), Some("Cali Norte"));
    assert_eq!(treated.yearcohort.as_deref(), Some("2023"));
}

#[test]
fn test_one_row_per_up_id_without_placeholders() {
    let inputs = LinkInputs {
        registry: table(
            &["nit", "source_year", "ciiu_principal"],
            &[
                &["88217688", "2023", "1410"],
                &["1", "2023", "1410"],
                &["300", "2023", "1410"],
                &["300", "2023", "9999"],
            ],
        ),
        registry_coordinates: vec![
            coordinate("88217688", 4.7, -74.1),
            coordinate("1", 4.7, -74.1),
            coordinate("300", 4.7, -74.1),
        ],
        participants: table(
            &["numberid_emp1", "nit", "centro", "yearcohort"],
            &[
                // Known bad id, remapped onto the registry entity
                &["21", "18217688", "Suba", "2022"],
                &["22", "300 2", "Suba", "2022"],
                &["23", "300", "Suba", "2023"],
                &["24", "0", "Suba", "2022"],
            ],
        ),
        participant_coordinates: vec![
            coordinate("21", 4.7, -74.1),
            coordinate("22", 4.7, -74.1),
            coordinate("23", 4.7, -74.1),
            coordinate("24", 4.7, -74.1),
        ],
    };

    let linked = linker().link(&inputs).unwrap();

    let ids: Vec<&str> = linked.entities.iter().map(|e| e.up_id.as_str()).collect();
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len());
    assert!(!unique.contains("0"));
    assert!(!unique.contains("1"));
    assert!(!unique.contains("18217688"));
    assert_eq!(ids, vec!["300", "88217688"]);

    assert_eq!(entity(&linked, "88217688").source, LinkSource::Both);
    // First participant claiming 300 wins
    let attributes = &entity(&linked, "300").attributes;
    let numberid = linked
        .attribute_columns
        .iter()
        .position(|c| c == "numberid_emp1")
        .unwrap();
    assert_eq!(attributes[numberid].as_deref(), Some("22"));
}
