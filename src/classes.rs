//! Table of loaded classes, with method resolution and instance field
//! layouts.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::info;

use crate::program::{ClassDef, CodeImage, MethodDef};

/// A class definition and the image it came from. Indices inside the
/// definition (fields, methods, strings) are relative to that image.
#[derive(Debug, Clone)]
pub struct LoadedClass {
    image: Arc<CodeImage>,
    index: usize,
}

impl LoadedClass {
    pub fn def(&self) -> &ClassDef {
        &self.image.classes[self.index]
    }

    pub fn image(&self) -> &Arc<CodeImage> {
        &self.image
    }
}

/// Instance field position in an object's field array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    pub class: String,
    pub name: String,
    pub field_type: String,
}

#[derive(Debug, Default)]
pub struct ClassTable {
    classes: HashMap<String, LoadedClass>,
    // Instance layouts by class descriptor, superclass fields first.
    layouts: HashMap<String, Arc<Vec<FieldSlot>>>,
    // Resolved slot per (image, field index).
    slots: HashMap<(usize, u32), Option<usize>>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every class of `image`. A class already present under the
    /// same name is replaced. Returns the names that were replaced.
    pub fn insert_image(&mut self, image: &Arc<CodeImage>) -> Vec<String> {
        let mut replaced = Vec::new();
        for (index, class) in image.classes.iter().enumerate() {
            let loaded = LoadedClass {
                image: Arc::clone(image),
                index,
            };
            if self.classes.insert(class.name.clone(), loaded).is_some() {
                info!(target: "runtime", "class {} replaced", class.name);
                replaced.push(class.name.clone());
            }
        }
        // Layouts and slots may depend on any replaced class.
        self.layouts.clear();
        self.slots.clear();
        replaced
    }

    pub fn get(&self, name: &str) -> Option<&LoadedClass> {
        self.classes.get(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Loaded superclass chain starting at `name` itself. Stops at the
    /// first class that is not loaded and at cycles.
    fn chain<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (&'a str, Option<&'a LoadedClass>)> {
        let mut seen = HashSet::new();
        let mut next = Some(name);
        std::iter::from_fn(move || {
            let current = next.take()?;
            if !seen.insert(current) {
                return None;
            }
            let loaded = self.classes.get(current);
            next = loaded.map(|c| c.def().superclass.as_str());
            Some((current, loaded))
        })
    }

    pub fn superclass(&self, name: &str) -> Option<&str> {
        self.classes.get(name).map(|c| c.def().superclass.as_str())
    }

    /// Finds a method by name and signature on `class` or the nearest
    /// superclass declaring it.
    pub fn resolve_method(
        &self,
        class: &str,
        name: &str,
        signature: &str,
    ) -> Option<(Arc<MethodDef>, Arc<CodeImage>)> {
        self.chain(class).find_map(|(_, loaded)| {
            let loaded = loaded?;
            loaded
                .def()
                .find_method(name, signature)
                .map(|m| (Arc::clone(m), Arc::clone(&loaded.image)))
        })
    }

    /// Instance fields of `class`, inherited ones first. Unloaded classes
    /// contribute no fields.
    pub fn layout(&mut self, class: &str) -> Arc<Vec<FieldSlot>> {
        if let Some(layout) = self.layouts.get(class) {
            return Arc::clone(layout);
        }
        let mut chain: Vec<&LoadedClass> = self.chain(class).filter_map(|(_, c)| c).collect();
        chain.reverse();
        let mut slots = Vec::new();
        for loaded in chain {
            let def = loaded.def();
            for field in &def.instance_fields {
                if let Some(field_ref) = loaded.image.field(field.field_idx) {
                    slots.push(FieldSlot {
                        class: def.name.clone(),
                        name: field_ref.name.clone(),
                        field_type: field_ref.field_type.clone(),
                    });
                }
            }
        }
        let layout = Arc::new(slots);
        self.layouts.insert(class.to_string(), Arc::clone(&layout));
        layout
    }

    /// Slot of instance field `field_idx` of `image`. `None` when the field
    /// is not declared by the referenced class or any loaded superclass.
    pub fn field_slot(&mut self, image: &Arc<CodeImage>, field_idx: u32) -> Option<usize> {
        let key = (Arc::as_ptr(image) as usize, field_idx);
        if let Some(slot) = self.slots.get(&key) {
            return *slot;
        }
        let slot = image.field(field_idx).and_then(|field| {
            self.layout(&field.class)
                .iter()
                .rposition(|s| s.name == field.name)
        });
        self.slots.insert(key, slot);
        slot
    }

    /// Class whose static table holds `name` when accessed through
    /// `class`: the nearest loaded class declaring it, or `class` itself.
    pub fn static_owner(&self, class: &str, name: &str) -> String {
        self.chain(class)
            .find_map(|(current, loaded)| {
                let loaded = loaded?;
                loaded
                    .def()
                    .static_fields
                    .iter()
                    .filter_map(|f| loaded.image.field(f.field_idx))
                    .any(|f| f.name == name)
                    .then(|| current.to_string())
            })
            .unwrap_or_else(|| class.to_string())
    }
}
