//! Prompt templates for address normalization
//!
//! Each template carries exactly one [`BATCH_PLACEHOLDER`], replaced by the
//! pretty-printed JSON object of `id -> raw address` for the batch.

use crate::error::{GeoError, GeoResult};
use inn_common::Dataset;

pub const BATCH_PLACEHOLDER: &str = "{batch_addresses}";

/// Participant roster addresses: free text typed by programme staff
pub const PARTICIPANT_PROMPT: &str = r#"
You standardize Colombian postal addresses for geocoding.

The input is a JSON object mapping an identifier to a raw address. Answer with
one JSON object only: no prose, no markdown fences. Use the same identifiers as
keys. Each value is an object with exactly these keys:

- "formatted_address": street/block part plus neighbourhood, cleaned up
  (e.g. "Calle 4 #10-22, Barrio Centro")
- "country": "CO"
- "area": the department (e.g. "Antioquia", "Tolima")
- "city": the municipality with proper accents (e.g. "Ibagué")

Rules:
1. Keep building numbers. Never turn "Calle 4 #10-22" into an intersection.
2. Infer department and country from a recognizable municipality.
3. Expand Manzana/Lote, Diagonal and Transversal spellings consistently.
4. If the address cannot be located (no street, block or landmark), set all
   four values to null. Never fill only some of them.

Example input:
{
  "A1": "MANZANA Q LOTE 15, BARRIO LA FLORESTA, IBAGUE",
  "A2": "una tienda en el centro"
}

Example output:
{
  "A1": {"formatted_address": "Manzana Q Lote 15, Barrio La Floresta", "country": "CO", "area": "Tolima", "city": "Ibagué"},
  "A2": {"formatted_address": null, "country": null, "area": null, "city": null}
}

Addresses:

{batch_addresses}
"#;

/// Registry addresses: heavily abbreviated commercial addresses
pub const REGISTRY_PROMPT: &str = r#"
You reconstruct abbreviated Colombian commercial-registry addresses into a
clean form suitable for a geocoding API.

The input is a JSON object mapping an identifier to a raw address followed by
its municipality and department. Answer with one JSON object only: no prose,
no markdown fences. Use the same identifiers as keys. Each value is an object
with exactly these keys: "formatted_address", "country", "area", "city".

Rules:
1. Expand abbreviations: CL/CLL -> Calle, CR/CRA/KR -> Carrera,
   NRO/NO -> #, MZ -> Manzana, B/ or BRR -> Barrio.
2. Rebuild bare number runs: "CR 18 55 37" -> "Carrera 18 #55-37".
3. Write corners as "Primary #Cross", e.g. "CRA 21 CLL 16 ESQUINA" ->
   "Carrera 21 #16". Do not use "y".
4. Append unit details (APTO 702, LOCAL 3, building names) at the end.
5. "country" is "Colombia"; "area" is the department; "city" the municipality.
6. Purely descriptive addresses that cannot be located get null for all four
   values. Never fill only some of them.

Example input:
{
  "R1": "CR 18 55 37, Armenia, Quindio",
  "R2": "PRIMERA CASA VIA AL VALLE AL LADO IZQUIERDO, Salento, Quindio"
}

Example output:
{
  "R1": {"formatted_address": "Carrera 18 #55-37", "country": "Colombia", "area": "Quindío", "city": "Armenia"},
  "R2": {"formatted_address": null, "country": null, "area": null, "city": null}
}

Addresses:

{batch_addresses}
"#;

/// Template for a dataset
pub fn template_for(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::Rues => REGISTRY_PROMPT,
        Dataset::Zasca => PARTICIPANT_PROMPT,
    }
}

/// Reject templates without the batch placeholder
pub fn check_template(template: &str) -> GeoResult<()> {
    if template.contains(BATCH_PLACEHOLDER) {
        Ok(())
    } else {
        Err(GeoError::Template(BATCH_PLACEHOLDER))
    }
}

/// Substitute the formatted batch into the template
pub fn fill_template(template: &str, formatted_batch: &str) -> String {
    template.replace(BATCH_PLACEHOLDER, formatted_batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_have_single_placeholder() {
        for dataset in [Dataset::Rues, Dataset::Zasca] {
            let template = template_for(dataset);
            assert_eq!(template.matches(BATCH_PLACEHOLDER).count(), 1);
            assert!(check_template(template).is_ok());
        }
    }

    #[test]
    fn test_fill_template() {
        let filled = fill_template("before\n{batch_addresses}\nafter", "{\"1\": \"x\"}");
        assert_eq!(filled, "before\n{\"1\": \"x\"}\nafter");
    }

    #[test]
    fn test_missing_placeholder_rejected() {
        assert!(matches!(
            check_template("no slot here"),
            Err(GeoError::Template(_))
        ));
    }
}
