use pkcs11_sys::CK_SLOT_ID;
use tracing::debug;

use crate::{HError, HResult, backend::Pkcs11Backend, config::SlotSelector};

/// Pick the slot to work on among those the library enumerates.
///
/// * an explicit slot id is used as is,
/// * a single enumerated slot is used whatever the configured name,
/// * otherwise the first slot whose description starts with the configured
///   name wins.
///
/// The result must be one of the enumerated slots.
///
/// # Errors
///
/// `HError::DeviceUnavailable` when no slot is enumerated, when no
/// description matches the name or when the explicit id is unknown.
/// Enumeration failures of the backend are passed through.
pub fn resolve_slot(backend: &dyn Pkcs11Backend, selector: &SlotSelector) -> HResult<CK_SLOT_ID> {
    let slots = backend.slot_list()?;
    debug!("Found the slots: {slots:?}");
    let only_slot = match slots.as_slice() {
        [] => {
            return Err(HError::DeviceUnavailable(
                "No HSM connected. No slots found.".to_owned(),
            ));
        }
        [only] => Some(*only),
        _ => None,
    };

    let resolved = match (selector, only_slot) {
        (SlotSelector::Id(id), _) => Some(*id),
        (_, Some(only)) => Some(only),
        (SlotSelector::Name(name), None) => find_slot_by_name(backend, &slots, name)?,
        (SlotSelector::Only, None) => None,
    };

    match resolved {
        Some(slot_id) if slots.contains(&slot_id) => {
            debug!("Using slot {slot_id}");
            Ok(slot_id)
        }
        Some(slot_id) => Err(HError::DeviceUnavailable(format!(
            "Slot {slot_id} not present"
        ))),
        None => Err(HError::DeviceUnavailable(format!(
            "Slot not present: no slot matches {selector:?} among {} slots",
            slots.len()
        ))),
    }
}

fn find_slot_by_name(
    backend: &dyn Pkcs11Backend,
    slots: &[CK_SLOT_ID],
    name: &str,
) -> HResult<Option<CK_SLOT_ID>> {
    for &slot_id in slots {
        let description = backend.slot_description(slot_id)?;
        debug!("Found slot {slot_id}: '{description}'");
        if description.starts_with(name) {
            return Ok(Some(slot_id));
        }
    }
    Ok(None)
}
